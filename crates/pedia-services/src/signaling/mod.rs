//! Signaling: relaying opaque negotiation payloads between peers that do
//! not yet share a direct link.
//!
//! The relay never inspects payloads. A node registers once under its peer
//! id and then receives every offer/answer addressed to it as a
//! [`SignalEvent`]. Relaying to a peer the relay does not know is reported
//! back, never dropped silently.

use pedia_core::PeerId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

mod local;
mod server;
mod tcp;

pub use local::{LocalRelay, LocalSignaling};
pub use server::RelayServer;
pub use tcp::TcpSignaling;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
}

/// One negotiation message. The payload is transport-specific.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
}

impl Signal {
    pub fn offer(payload: Vec<u8>) -> Self {
        Self {
            kind: SignalKind::Offer,
            payload,
        }
    }

    pub fn answer(payload: Vec<u8>) -> Self {
        Self {
            kind: SignalKind::Answer,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalEvent {
    /// A signal addressed to us.
    Received { from: PeerId, signal: Signal },
    /// An earlier relay to `target` could not be delivered.
    Unreachable { target: PeerId },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalingError {
    #[error("peer {0} is not registered with the relay")]
    PeerUnreachable(PeerId),
    #[error("not registered")]
    NotRegistered,
    #[error("relay connection closed")]
    Closed,
    #[error("relay io: {0}")]
    Io(String),
}

pub type SignalReceiver = mpsc::UnboundedReceiver<SignalEvent>;

pub trait SignalingClient: Send + Sync {
    /// Register `peer` with the relay. Signals addressed to it arrive on the
    /// returned receiver. Registering again replaces the previous receiver.
    fn register(
        &self,
        peer: &PeerId,
        capabilities: &[String],
    ) -> Result<SignalReceiver, SignalingError>;

    /// Forward `signal` to `target`. `PeerUnreachable` is returned when the
    /// relay already knows the target is absent; remote relays may instead
    /// report it later as [`SignalEvent::Unreachable`].
    fn relay(&self, target: &PeerId, signal: Signal) -> Result<(), SignalingError>;
}

// ── Relay protocol ────────────────────────────────────────────────────────────

/// One line of the TCP relay protocol (newline-delimited JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub(crate) enum RelayFrame {
    Register {
        peer_id: PeerId,
        #[serde(default)]
        capabilities: Vec<String>,
    },
    Registered {
        peer_id: PeerId,
    },
    Relay {
        target: PeerId,
        signal: Signal,
    },
    Deliver {
        from: PeerId,
        signal: Signal,
    },
    Unreachable {
        target: PeerId,
    },
}

impl RelayFrame {
    pub(crate) fn to_line(&self) -> Result<String, SignalingError> {
        let mut line = serde_json::to_string(self).map_err(|e| SignalingError::Io(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
