//! Peer link manager.
//!
//! Owns at most one live [`PeerLink`] per remote peer. Links are created
//! by `connect` (we initiate) or by an offer arriving over signaling (we
//! respond). Each link is driven by a single task that performs the
//! negotiation, multiplexes the three channels and is the only writer of
//! the link's state.
//!
//! Simultaneous offers are resolved by peer id: the offer from the lower
//! id wins. After an unexpected failure the initiating side reconnects
//! with a fixed backoff until the attempt budget runs out, then reports
//! the peer gone.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use pedia_core::config::LinkConfig;
use pedia_core::wire::{Channel, MAX_FRAME_PAYLOAD};
use pedia_core::PeerId;
use tokio::sync::mpsc;

use crate::events::{Event, EventBus};
use crate::signaling::{SignalEvent, SignalKind, SignalReceiver, SignalingClient, SignalingError};
use crate::transport::{Connector, TransportError};

mod state;
mod task;

pub use state::{ChannelState, LinkSnapshot, LinkState, PeerLink};

use state::LinkCommand;
use task::Role;

/// Frames queued per link on the unreliable channel before new ones drop.
const UNRELIABLE_BACKLOG: usize = 64;

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub negotiation_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub max_reconnect_attempts: u32,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self::from(&LinkConfig::default())
    }
}

impl From<&LinkConfig> for LinkSettings {
    fn from(config: &LinkConfig) -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(config.negotiation_timeout_secs),
            reconnect_backoff: Duration::from_secs(config.reconnect_backoff_secs),
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("{channel:?} channel to {peer} is not open")]
    ChannelNotReady { peer: PeerId, channel: Channel },
    #[error("{len} byte payload for {peer} exceeds the frame limit")]
    PayloadTooLarge { peer: PeerId, len: usize },
    #[error("negotiation with {0} timed out")]
    NegotiationTimeout(PeerId),
    #[error("link to {0} closed")]
    LinkClosed(PeerId),
    #[error("no link to {0}")]
    NoLink(PeerId),
    #[error("refusing to link to ourselves")]
    SelfConnect,
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// A frame the link task cannot encode would fail the write and tear the
// link down, so oversized payloads never reach a link's queue.
pub(crate) fn check_frame_size(peer: &PeerId, payload: &[u8]) -> Result<(), LinkError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(LinkError::PayloadTooLarge {
            peer: peer.clone(),
            len: payload.len(),
        });
    }
    Ok(())
}

/// Traffic and channel lifecycle surfaced to the message router.
#[derive(Debug)]
pub enum LinkEvent {
    ChannelOpen { peer: PeerId, channel: Channel },
    Message {
        peer: PeerId,
        channel: Channel,
        payload: Vec<u8>,
    },
    Bulk { peer: PeerId, payload: Vec<u8> },
}

pub type LinkInbound = mpsc::UnboundedReceiver<LinkEvent>;

pub(crate) struct Shared {
    local: PeerId,
    settings: LinkSettings,
    connector: Arc<dyn Connector>,
    signaling: Arc<dyn SignalingClient>,
    links: DashMap<PeerId, Arc<PeerLink>>,
    /// Reconnect attempts since the last successful connection.
    reconnects: DashMap<PeerId, u32>,
    inbound: mpsc::UnboundedSender<LinkEvent>,
    events: EventBus,
    next_generation: AtomicU64,
    shutting_down: AtomicBool,
}

#[derive(Clone)]
pub struct PeerLinkManager {
    shared: Arc<Shared>,
}

impl PeerLinkManager {
    /// Register with signaling and start answering offers. Must be called
    /// inside a tokio runtime.
    pub fn start(
        local: PeerId,
        settings: LinkSettings,
        connector: Arc<dyn Connector>,
        signaling: Arc<dyn SignalingClient>,
        events: EventBus,
        capabilities: &[String],
    ) -> Result<(Self, LinkInbound), LinkError> {
        let signals = signaling.register(&local, capabilities)?;
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            local,
            settings,
            connector,
            signaling,
            links: DashMap::new(),
            reconnects: DashMap::new(),
            inbound,
            events,
            next_generation: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        });
        tokio::spawn(signal_loop(Arc::downgrade(&shared), signals));
        tracing::info!(peer = %shared.local, "link manager started");
        Ok((Self { shared }, inbound_rx))
    }

    pub fn local_id(&self) -> &PeerId {
        &self.shared.local
    }

    /// Return the live link to `peer`, starting a negotiation if there is
    /// none. Concurrent callers share one link and one negotiation.
    pub fn connect(&self, peer: &PeerId) -> Result<Arc<PeerLink>, LinkError> {
        if *peer == self.shared.local {
            return Err(LinkError::SelfConnect);
        }
        self.shared.reconnects.remove(peer);
        Ok(self.shared.connect(peer))
    }

    /// Answer an offer received out of band.
    pub fn accept_incoming(
        &self,
        peer: &PeerId,
        offer: Vec<u8>,
    ) -> Result<Option<Arc<PeerLink>>, LinkError> {
        self.shared.accept_incoming(peer, offer)
    }

    pub fn send_reliable(&self, peer: &PeerId, payload: Vec<u8>) -> Result<(), LinkError> {
        self.require(peer)?.send(Channel::Reliable, payload)
    }

    /// Send raw bytes on the bulk channel. Without a link this reports the
    /// bulk channel as not ready; bulk traffic is never queued for later.
    pub fn send_bulk(&self, peer: &PeerId, payload: Vec<u8>) -> Result<(), LinkError> {
        let link = self.link(peer).ok_or_else(|| LinkError::ChannelNotReady {
            peer: peer.clone(),
            channel: Channel::Bulk,
        })?;
        link.send(Channel::Bulk, payload)
    }

    /// Best effort; returns whether the frame was queued. Oversized
    /// payloads are refused up front.
    pub fn send_unreliable(&self, peer: &PeerId, payload: Vec<u8>) -> Result<bool, LinkError> {
        check_frame_size(peer, &payload)?;
        match self.link(peer) {
            Some(link) => link.send_unreliable(payload),
            None => Ok(false),
        }
    }

    /// Tear down the link to `peer`. Returns false if there was none.
    pub fn disconnect(&self, peer: &PeerId) -> bool {
        self.shared.reconnects.remove(peer);
        match self.shared.links.remove(peer) {
            Some((_, link)) => {
                link.close();
                tracing::info!(peer = %peer, "peer disconnected");
                self.shared.events.emit(Event::PeerRemoved {
                    peer_id: peer.clone(),
                });
                true
            }
            None => false,
        }
    }

    pub fn link(&self, peer: &PeerId) -> Option<Arc<PeerLink>> {
        self.shared.links.get(peer).map(|l| l.clone())
    }

    pub fn link_state(&self, peer: &PeerId) -> Option<LinkState> {
        self.link(peer).map(|l| l.state())
    }

    pub fn channel_ready(&self, peer: &PeerId, channel: Channel) -> bool {
        self.link(peer)
            .map(|l| l.channel_ready(channel))
            .unwrap_or(false)
    }

    /// True when the reliable channel to `peer` is open.
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.channel_ready(peer, Channel::Reliable)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.shared
            .links
            .iter()
            .filter(|e| e.value().channel_ready(Channel::Reliable))
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<LinkSnapshot> {
        let mut out: Vec<_> = self.shared.links.iter().map(|e| e.value().snapshot()).collect();
        out.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        out
    }

    /// Close every link and stop reconnecting.
    pub fn shutdown(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        let peers: Vec<PeerId> = self.shared.links.iter().map(|e| e.key().clone()).collect();
        for peer in peers {
            if let Some((_, link)) = self.shared.links.remove(&peer) {
                link.close();
            }
        }
        tracing::info!(peer = %self.shared.local, "link manager shut down");
    }

    fn require(&self, peer: &PeerId) -> Result<Arc<PeerLink>, LinkError> {
        self.link(peer).ok_or_else(|| LinkError::NoLink(peer.clone()))
    }
}

impl Shared {
    fn connect(self: &Arc<Self>, peer: &PeerId) -> Arc<PeerLink> {
        match self.links.entry(peer.clone()) {
            Entry::Occupied(mut e) => {
                if e.get().state() != LinkState::Closed {
                    return e.get().clone();
                }
                let link = self.spawn_link(peer, Role::Initiator);
                e.insert(link.clone());
                link
            }
            Entry::Vacant(v) => {
                let link = self.spawn_link(peer, Role::Initiator);
                v.insert(link.clone());
                link
            }
        }
    }

    fn accept_incoming(
        self: &Arc<Self>,
        peer: &PeerId,
        offer: Vec<u8>,
    ) -> Result<Option<Arc<PeerLink>>, LinkError> {
        if *peer == self.local {
            return Err(LinkError::SelfConnect);
        }
        match self.links.entry(peer.clone()) {
            Entry::Occupied(mut e) => {
                let existing = e.get().clone();
                // Our own offer outranks theirs, including a stale copy of
                // theirs arriving after ours already connected.
                if existing.is_initiator()
                    && existing.state() != LinkState::Closed
                    && self.local < *peer
                {
                    tracing::debug!(peer = %peer, "simultaneous offers, keeping ours");
                    return Ok(None);
                }
                tracing::debug!(
                    peer = %peer,
                    replaced = existing.generation(),
                    "offer replaces existing link"
                );
                existing.close();
                let link = self.spawn_link(peer, Role::Responder { offer });
                e.insert(link.clone());
                Ok(Some(link))
            }
            Entry::Vacant(v) => {
                let link = self.spawn_link(peer, Role::Responder { offer });
                v.insert(link.clone());
                Ok(Some(link))
            }
        }
    }

    fn spawn_link(self: &Arc<Self>, peer: &PeerId, role: Role) -> Arc<PeerLink> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<LinkCommand>();
        let (unrel_tx, unrel_rx) = mpsc::channel(UNRELIABLE_BACKLOG);
        let initiator = matches!(role, Role::Initiator);
        let link = Arc::new(PeerLink::new(
            peer.clone(),
            generation,
            initiator,
            cmd_tx,
            unrel_tx,
        ));
        tracing::debug!(peer = %peer, generation, initiator, "link created");
        tokio::spawn(task::drive(self.clone(), link.clone(), role, cmd_rx, unrel_rx));
        link
    }

    fn schedule_reconnect(self: &Arc<Self>, peer: PeerId) {
        let attempt = {
            let mut n = self.reconnects.entry(peer.clone()).or_insert(0);
            *n += 1;
            *n
        };
        if attempt > self.settings.max_reconnect_attempts {
            self.reconnects.remove(&peer);
            tracing::warn!(peer = %peer, attempts = attempt - 1, "peer gone");
            self.events.emit(Event::PeerGone { peer_id: peer });
            return;
        }

        tracing::info!(
            peer = %peer,
            attempt,
            backoff_ms = self.settings.reconnect_backoff.as_millis() as u64,
            "scheduling reconnect"
        );
        let shared = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(shared.settings.reconnect_backoff).await;
            if !shared.shutting_down.load(Ordering::SeqCst) {
                shared.connect(&peer);
            }
        });
    }
}

async fn signal_loop(shared: Weak<Shared>, mut signals: SignalReceiver) {
    while let Some(event) = signals.recv().await {
        let Some(shared) = shared.upgrade() else { break };
        match event {
            SignalEvent::Received { from, signal } => match signal.kind {
                SignalKind::Offer => {
                    if let Err(e) = shared.accept_incoming(&from, signal.payload) {
                        tracing::warn!(peer = %from, error = %e, "rejected offer");
                    }
                }
                SignalKind::Answer => {
                    let delivered = shared
                        .links
                        .get(&from)
                        .map(|l| l.clone())
                        .map(|l| l.deliver_answer(signal.payload))
                        .unwrap_or(false);
                    if !delivered {
                        tracing::debug!(peer = %from, "answer with no pending offer");
                    }
                }
            },
            SignalEvent::Unreachable { target } => {
                tracing::warn!(peer = %target, "peer unreachable via relay");
                if let Some(link) = shared.links.get(&target).map(|l| l.clone()) {
                    if link.is_initiator() && link.state() == LinkState::Negotiating {
                        link.withdraw_answer();
                    }
                }
            }
        }
    }
    tracing::debug!("signaling stream ended");
}

#[cfg(test)]
mod tests;
