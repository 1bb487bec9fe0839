//! In-process relay. Every node in one process shares a [`LocalRelay`];
//! used by tests and single-process demos.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use pedia_core::PeerId;
use tokio::sync::mpsc;

use super::{Signal, SignalEvent, SignalReceiver, SignalingClient, SignalingError};

struct Registration {
    capabilities: Vec<String>,
    tx: mpsc::UnboundedSender<SignalEvent>,
}

#[derive(Clone, Default)]
pub struct LocalRelay {
    peers: Arc<DashMap<PeerId, Registration>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// A client handle for one node.
    pub fn client(&self) -> LocalSignaling {
        LocalSignaling {
            relay: self.clone(),
            local: Arc::new(Mutex::new(None)),
        }
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn capabilities(&self, peer: &PeerId) -> Option<Vec<String>> {
        self.peers.get(peer).map(|r| r.capabilities.clone())
    }

    /// Drop a registration, as if the peer's relay connection closed.
    pub fn unregister(&self, peer: &PeerId) {
        self.peers.remove(peer);
    }
}

#[derive(Clone)]
pub struct LocalSignaling {
    relay: LocalRelay,
    local: Arc<Mutex<Option<PeerId>>>,
}

impl SignalingClient for LocalSignaling {
    fn register(
        &self,
        peer: &PeerId,
        capabilities: &[String],
    ) -> Result<SignalReceiver, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.relay.peers.insert(
            peer.clone(),
            Registration {
                capabilities: capabilities.to_vec(),
                tx,
            },
        );
        *self.local.lock().unwrap_or_else(|e| e.into_inner()) = Some(peer.clone());
        tracing::debug!(peer = %peer, "registered with local relay");
        Ok(rx)
    }

    fn relay(&self, target: &PeerId, signal: Signal) -> Result<(), SignalingError> {
        let from = self
            .local
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(SignalingError::NotRegistered)?;

        let delivered = self
            .relay
            .peers
            .get(target)
            .map(|r| r.tx.send(SignalEvent::Received { from, signal }).is_ok())
            .unwrap_or(false);

        if delivered {
            Ok(())
        } else {
            Err(SignalingError::PeerUnreachable(target.clone()))
        }
    }
}
