//! Outstanding chunk requests, keyed by (peer, chunk).
//!
//! Replies arrive on the router's dispatch task; the fetch that asked is
//! waiting on a oneshot. Several transfers may wait on the same key when
//! they share a chunk.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use pedia_core::{ChunkId, PeerId};
use tokio::sync::oneshot;

#[derive(Debug, Clone)]
pub(crate) enum ChunkReply {
    Data(Bytes),
    Unavailable,
    /// The peer's link went away before it answered.
    Disconnected,
}

type Waiters = Vec<oneshot::Sender<ChunkReply>>;

#[derive(Clone, Default)]
pub(crate) struct ChunkRequests {
    waiting: Arc<DashMap<(PeerId, ChunkId), Waiters>>,
}

impl ChunkRequests {
    pub(crate) fn register(&self, peer: &PeerId, chunk: ChunkId) -> oneshot::Receiver<ChunkReply> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiting.entry((peer.clone(), chunk)).or_default();
        waiters.retain(|w| !w.is_closed());
        waiters.push(tx);
        rx
    }

    /// Hand `reply` to everyone waiting on (peer, chunk). Returns false for
    /// unsolicited replies.
    pub(crate) fn resolve(&self, peer: &PeerId, chunk: ChunkId, reply: ChunkReply) -> bool {
        match self.waiting.remove(&(peer.clone(), chunk)) {
            Some((_, waiters)) => {
                let mut delivered = false;
                for w in waiters {
                    delivered |= w.send(reply.clone()).is_ok();
                }
                delivered
            }
            None => false,
        }
    }

    /// Fail every request outstanding to `peer`.
    pub(crate) fn fail_peer(&self, peer: &PeerId) -> usize {
        let keys: Vec<_> = self
            .waiting
            .iter()
            .filter(|e| e.key().0 == *peer)
            .map(|e| e.key().clone())
            .collect();
        let mut failed = 0;
        for key in keys {
            if let Some((_, waiters)) = self.waiting.remove(&key) {
                for w in waiters {
                    if w.send(ChunkReply::Disconnected).is_ok() {
                        failed += 1;
                    }
                }
            }
        }
        failed
    }

    /// Drop waiters whose fetch gave up (timed out or was cancelled).
    pub(crate) fn prune(&self) {
        self.waiting.retain(|_, waiters| {
            waiters.retain(|w| !w.is_closed());
            !waiters.is_empty()
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.waiting.len()
    }
}
