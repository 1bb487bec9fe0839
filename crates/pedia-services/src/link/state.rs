//! Per-peer link handle and its state machine.
//!
//! `Negotiating → Connected → Closed`, or `Negotiating → Closed`. Only the
//! link's own task advances the state; everything else reads it.

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use pedia_core::wire::Channel;
use pedia_core::PeerId;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use super::{check_frame_size, LinkError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Negotiating,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelState {
    pub channel: Channel,
    pub ready: bool,
}

pub(crate) struct LinkStatus {
    state: LinkState,
    ready: [bool; 3],
    last_activity: Instant,
}

impl LinkStatus {
    fn new() -> Self {
        Self {
            state: LinkState::Negotiating,
            ready: [false; 3],
            last_activity: Instant::now(),
        }
    }

    /// Apply a transition. Returns false (and changes nothing) for any
    /// transition the state machine does not allow.
    pub(crate) fn advance(&mut self, to: LinkState) -> bool {
        use LinkState::*;
        match (self.state, to) {
            (Negotiating, Connected) | (Negotiating, Closed) | (Connected, Closed) => {
                self.state = to;
                if to == Closed {
                    self.ready = [false; 3];
                }
                true
            }
            _ => false,
        }
    }

    pub(crate) fn mark_ready(&mut self, channel: Channel) {
        if self.state != LinkState::Closed {
            self.ready[slot(channel)] = true;
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

fn slot(channel: Channel) -> usize {
    match channel {
        Channel::Reliable => 0,
        Channel::Unreliable => 1,
        Channel::Bulk => 2,
    }
}

pub(crate) enum LinkCommand {
    Send { channel: Channel, payload: Vec<u8> },
    Close,
}

/// Shared handle to one peer link. Cloned out of the manager's registry;
/// holding one does not keep the link open.
pub struct PeerLink {
    peer: PeerId,
    generation: u64,
    initiator: bool,
    created: Instant,
    status: Mutex<LinkStatus>,
    commands: mpsc::UnboundedSender<LinkCommand>,
    unreliable: mpsc::Sender<Vec<u8>>,
    answer: Mutex<Option<oneshot::Sender<Vec<u8>>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkSnapshot {
    pub peer_id: PeerId,
    pub generation: u64,
    pub state: LinkState,
    pub initiator: bool,
    pub channels: Vec<ChannelState>,
    pub age_ms: u64,
    pub idle_ms: u64,
}

impl PeerLink {
    pub(crate) fn new(
        peer: PeerId,
        generation: u64,
        initiator: bool,
        commands: mpsc::UnboundedSender<LinkCommand>,
        unreliable: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            peer,
            generation,
            initiator,
            created: Instant::now(),
            status: Mutex::new(LinkStatus::new()),
            commands,
            unreliable,
            answer: Mutex::new(None),
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    /// Distinguishes successive links to the same peer.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn state(&self) -> LinkState {
        self.status().state
    }

    pub fn channel_ready(&self, channel: Channel) -> bool {
        self.status().ready[slot(channel)]
    }

    pub fn channels(&self) -> Vec<ChannelState> {
        let status = self.status();
        Channel::ALL
            .iter()
            .map(|&channel| ChannelState {
                channel,
                ready: status.ready[slot(channel)],
            })
            .collect()
    }

    pub fn last_activity(&self) -> Instant {
        self.status().last_activity
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            peer_id: self.peer.clone(),
            generation: self.generation,
            state: self.state(),
            initiator: self.initiator,
            channels: self.channels(),
            age_ms: self.created.elapsed().as_millis() as u64,
            idle_ms: self.last_activity().elapsed().as_millis() as u64,
        }
    }

    pub(crate) fn with_status<R>(&self, f: impl FnOnce(&mut LinkStatus) -> R) -> R {
        f(&mut self.status())
    }

    fn status(&self) -> MutexGuard<'_, LinkStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a frame for the link task. Fails unless `channel` is open and
    /// the payload fits one frame.
    pub(crate) fn send(&self, channel: Channel, payload: Vec<u8>) -> Result<(), LinkError> {
        check_frame_size(&self.peer, &payload)?;
        if !self.channel_ready(channel) {
            return Err(LinkError::ChannelNotReady {
                peer: self.peer.clone(),
                channel,
            });
        }
        self.commands
            .send(LinkCommand::Send { channel, payload })
            .map_err(|_| LinkError::LinkClosed(self.peer.clone()))
    }

    /// Best effort: dropped when the channel is closed or backed up.
    pub(crate) fn send_unreliable(&self, payload: Vec<u8>) -> Result<bool, LinkError> {
        check_frame_size(&self.peer, &payload)?;
        Ok(self.channel_ready(Channel::Unreliable) && self.unreliable.try_send(payload).is_ok())
    }


    pub(crate) fn close(&self) {
        let _ = self.commands.send(LinkCommand::Close);
    }

    /// Install the slot the remote answer will be delivered into.
    pub(crate) fn arm_answer(&self) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        *self.answer.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }

    pub(crate) fn deliver_answer(&self, payload: Vec<u8>) -> bool {
        match self.answer.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Abandon a pending answer; the negotiation fails immediately.
    pub(crate) fn withdraw_answer(&self) {
        self.answer.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}
