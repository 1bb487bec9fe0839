//! Message router: typed JSON messages over peer links.
//!
//! Outbound messages to a peer whose reliable channel is not open yet are
//! queued and flushed, in order and exactly once, when it opens. Inbound
//! envelopes are dispatched to the handler registered for their `type`;
//! bulk-channel payloads go to the single bulk handler.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use pedia_core::wire::{Channel, Envelope, MAX_FRAME_PAYLOAD};
use pedia_core::PeerId;
use serde::Serialize;

use crate::link::{LinkError, LinkEvent, LinkInbound, PeerLinkManager};

/// Handles one or more envelope types.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, peer: &PeerId, envelope: &Envelope) -> anyhow::Result<()>;
}

/// Handles raw bulk-channel payloads.
pub trait BulkHandler: Send + Sync {
    fn handle_bulk(&self, peer: &PeerId, payload: &[u8]) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub msg_type: String,
    pub data: serde_json::Value,
    /// Unix milliseconds when the message was accepted.
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Delivered,
    Queued,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("failed to encode message: {0}")]
    Encode(String),
    #[error(transparent)]
    Link(#[from] LinkError),
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct RouterInner {
    links: PeerLinkManager,
    pending: DashMap<PeerId, VecDeque<QueuedMessage>>,
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
    bulk: RwLock<Option<Arc<dyn BulkHandler>>>,
}

#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

impl MessageRouter {
    /// Start dispatching `inbound`. Must be called inside a tokio runtime.
    pub fn start(links: PeerLinkManager, inbound: LinkInbound) -> Self {
        let inner = Arc::new(RouterInner {
            links,
            pending: DashMap::new(),
            handlers: DashMap::new(),
            bulk: RwLock::new(None),
        });
        tokio::spawn(dispatch_loop(inner.clone(), inbound));
        Self { inner }
    }

    pub fn links(&self) -> &PeerLinkManager {
        &self.inner.links
    }

    /// Route envelopes of `msg_type` to `handler`, replacing any previous one.
    pub fn register(&self, msg_type: &str, handler: Arc<dyn MessageHandler>) {
        self.inner.handlers.insert(msg_type.to_string(), handler);
    }

    pub fn set_bulk_handler(&self, handler: Arc<dyn BulkHandler>) {
        *self.inner.bulk.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Send a message on the reliable channel, queuing it if the channel
    /// is not open. Never blocks on the network.
    pub fn send<T: Serialize>(
        &self,
        peer: &PeerId,
        msg_type: &str,
        data: &T,
    ) -> Result<SendStatus, RouterError> {
        let data = serde_json::to_value(data).map_err(|e| RouterError::Encode(e.to_string()))?;
        let message = QueuedMessage {
            msg_type: msg_type.to_string(),
            data,
            timestamp: now_ms(),
        };
        let status = self.inner.send_or_queue(peer, message)?;
        if status == SendStatus::Queued {
            tracing::debug!(peer = %peer, msg_type, "message queued");
        }
        Ok(status)
    }

    /// Send to every peer with an open reliable channel. Returns how many
    /// sends were attempted.
    pub fn broadcast<T: Serialize>(&self, msg_type: &str, data: &T) -> Result<usize, RouterError> {
        let mut attempted = 0;
        for peer in self.inner.links.connected_peers() {
            attempted += 1;
            if let Err(e) = self.send(&peer, msg_type, data) {
                tracing::warn!(peer = %peer, msg_type, error = %e, "broadcast send failed");
            }
        }
        Ok(attempted)
    }

    /// Best-effort send on the unreliable channel. Not queued.
    pub fn send_unreliable<T: Serialize>(
        &self,
        peer: &PeerId,
        msg_type: &str,
        data: &T,
    ) -> Result<bool, RouterError> {
        let envelope = Envelope {
            msg_type: msg_type.to_string(),
            data: serde_json::to_value(data).map_err(|e| RouterError::Encode(e.to_string()))?,
            timestamp: now_ms(),
            from: self.inner.links.local_id().clone(),
        };
        let bytes = envelope
            .to_bytes()
            .map_err(|e| RouterError::Encode(e.to_string()))?;
        Ok(self.inner.links.send_unreliable(peer, bytes)?)
    }

    /// Messages waiting for `peer`'s reliable channel.
    pub fn pending(&self, peer: &PeerId) -> Vec<QueuedMessage> {
        self.inner
            .pending
            .get(peer)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn pending_total(&self) -> usize {
        self.inner.pending.iter().map(|q| q.len()).sum()
    }

    /// Drop everything queued for `peer`. Returns how many were dropped.
    pub fn clear_pending(&self, peer: &PeerId) -> usize {
        self.inner
            .pending
            .remove(peer)
            .map(|(_, q)| q.len())
            .unwrap_or(0)
    }

    /// Drop every queued message, for any peer, that `discard` selects.
    /// Returns how many were dropped.
    pub fn discard_pending(&self, mut discard: impl FnMut(&PeerId, &QueuedMessage) -> bool) -> usize {
        let mut dropped = 0;
        for mut entry in self.inner.pending.iter_mut() {
            let (peer, queue) = entry.pair_mut();
            let before = queue.len();
            queue.retain(|m| !discard(peer, m));
            dropped += before - queue.len();
        }
        self.inner.pending.retain(|_, q| !q.is_empty());
        dropped
    }
}

impl RouterInner {
    fn send_or_queue(&self, peer: &PeerId, message: QueuedMessage) -> Result<SendStatus, RouterError> {
        // Refused before queuing: a message that can never be framed would
        // otherwise sit at the head of the queue forever.
        let bytes = self.encode(peer, &message)?;
        let status = {
            // The entry guard serializes this with flush, so a direct send
            // can never overtake queued messages.
            let mut queue = self.pending.entry(peer.clone()).or_default();
            if queue.is_empty() && self.links.is_connected(peer) {
                match self.links.send_reliable(peer, bytes) {
                    Ok(()) => SendStatus::Delivered,
                    Err(e) => {
                        tracing::debug!(peer = %peer, error = %e, "direct send failed, queuing");
                        queue.push_back(message);
                        SendStatus::Queued
                    }
                }
            } else {
                queue.push_back(message);
                SendStatus::Queued
            }
        };
        self.pending.remove_if(peer, |_, q| q.is_empty());
        Ok(status)
    }

    /// Serialize `message` as an envelope from us, refusing anything that
    /// would not fit one frame.
    fn encode(&self, peer: &PeerId, message: &QueuedMessage) -> Result<Vec<u8>, RouterError> {
        let envelope = Envelope {
            msg_type: message.msg_type.clone(),
            data: message.data.clone(),
            timestamp: message.timestamp,
            from: self.links.local_id().clone(),
        };
        let bytes = envelope
            .to_bytes()
            .map_err(|e| RouterError::Encode(e.to_string()))?;
        if bytes.len() > MAX_FRAME_PAYLOAD {
            return Err(LinkError::PayloadTooLarge {
                peer: peer.clone(),
                len: bytes.len(),
            }
            .into());
        }
        Ok(bytes)
    }

    fn flush(&self, peer: &PeerId) {
        let mut flushed = 0;
        if let Some(mut queue) = self.pending.get_mut(peer) {
            while let Some(message) = queue.front() {
                let sent = self
                    .encode(peer, message)
                    .and_then(|bytes| self.links.send_reliable(peer, bytes).map_err(RouterError::from));
                match sent {
                    Ok(()) => {
                        queue.pop_front();
                        flushed += 1;
                    }
                    Err(RouterError::Link(LinkError::ChannelNotReady { .. }))
                    | Err(RouterError::Link(LinkError::LinkClosed(_)))
                    | Err(RouterError::Link(LinkError::NoLink(_))) => {
                        tracing::warn!(peer = %peer, remaining = queue.len(), "flush interrupted");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer, msg_type = %message.msg_type, error = %e, "dropping unsendable message");
                        queue.pop_front();
                    }
                }
            }
        }
        self.pending.remove_if(peer, |_, q| q.is_empty());
        if flushed > 0 {
            tracing::debug!(peer = %peer, flushed, "queued messages flushed");
        }
    }

    fn dispatch(&self, peer: &PeerId, payload: &[u8]) {
        let envelope = match Envelope::from_bytes(payload) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "dropping malformed envelope");
                return;
            }
        };
        let handler = self.handlers.get(&envelope.msg_type).map(|h| h.clone());
        match handler {
            Some(handler) => {
                if let Err(e) = handler.handle_message(peer, &envelope) {
                    tracing::warn!(
                        peer = %peer,
                        msg_type = %envelope.msg_type,
                        error = %e,
                        "message handling failed"
                    );
                }
            }
            None => {
                tracing::debug!(peer = %peer, msg_type = %envelope.msg_type, "no handler for message");
            }
        }
    }

    fn dispatch_bulk(&self, peer: &PeerId, payload: &[u8]) {
        let handler = self.bulk.read().unwrap_or_else(|e| e.into_inner()).clone();
        match handler {
            Some(handler) => {
                if let Err(e) = handler.handle_bulk(peer, payload) {
                    tracing::warn!(peer = %peer, error = %e, "bulk handling failed");
                }
            }
            None => tracing::debug!(peer = %peer, bytes = payload.len(), "no bulk handler"),
        }
    }
}

async fn dispatch_loop(inner: Arc<RouterInner>, mut inbound: LinkInbound) {
    while let Some(event) = inbound.recv().await {
        match event {
            LinkEvent::ChannelOpen {
                peer,
                channel: Channel::Reliable,
            } => inner.flush(&peer),
            LinkEvent::ChannelOpen { .. } => {}
            LinkEvent::Message { peer, payload, .. } => inner.dispatch(&peer, &payload),
            LinkEvent::Bulk { peer, payload } => inner.dispatch_bulk(&peer, &payload),
        }
    }
    tracing::debug!("router inbound closed");
}
