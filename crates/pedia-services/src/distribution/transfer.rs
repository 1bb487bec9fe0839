//! One inbound transfer: scheduling state and the fetch loop that drives it.
//!
//! The loop owns its [`TransferState`] outright, so every mutation happens
//! on one task. Up to K chunk requests are in flight at once; the next
//! chunk is always the highest-priority one neither downloaded nor in
//! flight, lowest index first.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use pedia_core::wire::{msg_types, ChunkRequest};
use pedia_core::{ChunkId, ChunkInfo, Manifest, PeerId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use super::requests::ChunkReply;
use super::scoring::PeerScores;
use super::{EngineInner, TransferError};
use crate::chunk_store::{ChunkStore, StoreError};
use crate::events::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Concurrent fetches allowed for a transfer at this priority.
    pub fn fill_level(self, k: usize) -> usize {
        match self {
            Priority::Low => (k / 2).max(1),
            Priority::Normal => k.max(1),
            Priority::High => (k + k / 2).max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferControl {
    Running,
    Paused,
    Cancelled,
}

/// Counters shared with status queries while the loop runs.
#[derive(Default)]
pub(crate) struct TransferProgress {
    pub downloaded: AtomicUsize,
    pub total: AtomicUsize,
}

#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub peer: PeerId,
    pub deadline: Instant,
}

pub(crate) struct TransferState {
    pub manifest: Arc<Manifest>,
    pub downloaded: HashSet<ChunkId>,
    pub in_flight: HashMap<ChunkId, InFlight>,
    pub candidates: BTreeSet<PeerId>,
    pub priority: Priority,
    pub paused: bool,
    pub started: Instant,
    /// Positions in `manifest.chunks`, best first.
    order: Vec<usize>,
    unique: usize,
    attempts: HashMap<ChunkId, u32>,
    lacking: HashMap<ChunkId, HashSet<PeerId>>,
    tried: HashMap<ChunkId, HashSet<PeerId>>,
    cursor: usize,
}

impl TransferState {
    pub fn new(manifest: Arc<Manifest>, candidates: BTreeSet<PeerId>, priority: Priority) -> Self {
        let mut order: Vec<usize> = (0..manifest.chunks.len()).collect();
        order.sort_by_key(|&i| {
            let c = &manifest.chunks[i];
            (std::cmp::Reverse(c.priority), c.index)
        });
        let unique = manifest.chunk_ids().collect::<HashSet<_>>().len();
        Self {
            manifest,
            downloaded: HashSet::new(),
            in_flight: HashMap::new(),
            candidates,
            priority,
            paused: false,
            started: Instant::now(),
            order,
            unique,
            attempts: HashMap::new(),
            lacking: HashMap::new(),
            tried: HashMap::new(),
            cursor: 0,
        }
    }

    /// Distinct chunks in the file.
    pub fn total(&self) -> usize {
        self.unique
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded.len() >= self.unique
    }

    pub fn fraction(&self) -> f64 {
        if self.unique == 0 {
            1.0
        } else {
            self.downloaded.len() as f64 / self.unique as f64
        }
    }

    pub fn next_chunk(&self) -> Option<&ChunkInfo> {
        self.order
            .iter()
            .map(|&i| &self.manifest.chunks[i])
            .find(|c| !self.downloaded.contains(&c.id) && !self.in_flight.contains_key(&c.id))
    }

    /// Choose a holder for `chunk`. Peers known to lack it are skipped and
    /// untried peers are preferred. With scores, selection is weighted;
    /// otherwise it rotates through the candidates.
    pub fn choose_peer<R: Rng>(
        &mut self,
        chunk: &ChunkId,
        scores: Option<&PeerScores>,
        rng: &mut R,
    ) -> Option<PeerId> {
        let lacking = self.lacking.get(chunk);
        let eligible: Vec<PeerId> = self
            .candidates
            .iter()
            .filter(|p| lacking.map(|l| !l.contains(*p)).unwrap_or(true))
            .cloned()
            .collect();
        if eligible.is_empty() {
            return None;
        }
        let tried = self.tried.get(chunk);
        let fresh: Vec<PeerId> = eligible
            .iter()
            .filter(|p| tried.map(|t| !t.contains(*p)).unwrap_or(true))
            .cloned()
            .collect();
        let pool = if fresh.is_empty() { eligible } else { fresh };

        let chosen = match scores {
            Some(scores) => scores.pick_weighted(&pool, rng).cloned(),
            None => {
                let pick = pool[self.cursor % pool.len()].clone();
                self.cursor = self.cursor.wrapping_add(1);
                Some(pick)
            }
        };
        if let Some(peer) = &chosen {
            self.tried.entry(*chunk).or_default().insert(peer.clone());
        }
        chosen
    }

    /// Count a failed attempt; returns the total so far.
    pub fn record_failure(&mut self, chunk: &ChunkId) -> u32 {
        let n = self.attempts.entry(*chunk).or_insert(0);
        *n += 1;
        *n
    }

    pub fn mark_lacking(&mut self, chunk: &ChunkId, peer: &PeerId) {
        self.lacking.entry(*chunk).or_default().insert(peer.clone());
    }

    pub fn remove_candidate(&mut self, peer: &PeerId) {
        self.candidates.remove(peer);
    }
}

/// How one fetch ended. Data is verified and written to the store inside
/// the fetch itself, off the scheduling task.
enum Fetched {
    Stored(usize),
    Corrupt,
    Unavailable,
    Disconnected,
    TimedOut,
    StoreFailed(TransferError),
}

struct FetchOutcome {
    chunk: ChunkId,
    peer: PeerId,
    fetched: Fetched,
    /// Request to reply; excludes the store write.
    elapsed: Duration,
}

/// Inputs the engine feeds a running transfer.
pub(crate) struct TransferSignals {
    pub control: watch::Receiver<TransferControl>,
    /// Peers whose link was torn down.
    pub departures: mpsc::UnboundedReceiver<PeerId>,
}

/// Drive `state` until every chunk is stored, the transfer fails, or it
/// is cancelled.
pub(crate) async fn fetch_all(
    engine: &Arc<EngineInner>,
    state: &mut TransferState,
    signals: &mut TransferSignals,
    progress: &TransferProgress,
) -> Result<(), TransferError> {
    let TransferSignals {
        control,
        departures,
    } = signals;
    let file_id = state.manifest.file_id.clone();
    let settings = &engine.settings;
    let mut fetches: FuturesUnordered<BoxFuture<'static, FetchOutcome>> = FuturesUnordered::new();

    // Chunks already present (shared files, overlapping downloads) count
    // as downloaded without a fetch.
    let store = engine.store.clone();
    let manifest = state.manifest.clone();
    let present = tokio::task::spawn_blocking(move || {
        manifest
            .chunk_ids()
            .filter(|id| store.has(id))
            .collect::<Vec<_>>()
    })
    .await?;
    state.downloaded.extend(present);
    progress.total.store(state.total(), Ordering::Relaxed);
    progress.downloaded.store(state.downloaded.len(), Ordering::Relaxed);
    if state.is_complete() {
        emit_progress(engine, state);
        return Ok(());
    }

    // Requests to holders still negotiating wait in the router's queue.
    for peer in &state.candidates {
        if let Err(e) = engine.links.connect(peer) {
            tracing::debug!(peer = %peer, error = %e, "could not start link to holder");
        }
    }

    loop {
        let current = *control.borrow_and_update();
        if current == TransferControl::Cancelled {
            return Err(TransferError::Cancelled(file_id));
        }
        state.paused = current == TransferControl::Paused;

        if !state.paused {
            let limit = state
                .priority
                .fill_level(settings.max_concurrent_fetches)
                .min(state.candidates.len())
                .max(1);
            while state.in_flight.len() < limit {
                let Some(chunk) = state.next_chunk().cloned() else { break };
                let scores = settings.peer_scoring.then_some(&engine.scores);
                let Some(peer) = state.choose_peer(&chunk.id, scores, &mut rand::thread_rng()) else {
                    tracing::warn!(file = %file_id, chunk = %chunk.id.short(), "no holder left for chunk");
                    return Err(TransferError::ChunkUnavailable {
                        file_id,
                        chunk_id: chunk.id,
                    });
                };
                fetches.push(dispatch(engine, state, &chunk, peer));
            }
        }

        if fetches.is_empty() {
            if state.paused {
                tokio::select! {
                    changed = control.changed() => {
                        if changed.is_err() {
                            return Err(TransferError::Cancelled(file_id));
                        }
                    }
                    Some(peer) = departures.recv() => state.remove_candidate(&peer),
                }
                continue;
            }
            // Nothing in flight and nothing dispatchable.
            return match state.next_chunk() {
                Some(chunk) => Err(TransferError::ChunkUnavailable {
                    file_id,
                    chunk_id: chunk.id,
                }),
                None => Ok(()),
            };
        }

        tokio::select! {
            Some(outcome) = fetches.next() => {
                handle_outcome(engine, state, outcome, progress)?;
                if state.is_complete() {
                    return Ok(());
                }
            }
            changed = control.changed() => {
                if changed.is_err() {
                    return Err(TransferError::Cancelled(file_id));
                }
            }
            Some(peer) = departures.recv() => {
                tracing::debug!(file = %file_id, peer = %peer, "holder departed");
                state.remove_candidate(&peer);
            }
        }
    }
}

fn dispatch(
    engine: &Arc<EngineInner>,
    state: &mut TransferState,
    chunk: &ChunkInfo,
    peer: PeerId,
) -> BoxFuture<'static, FetchOutcome> {
    let timeout = engine.settings.chunk_timeout;
    state.in_flight.insert(
        chunk.id,
        InFlight {
            peer: peer.clone(),
            deadline: Instant::now() + timeout,
        },
    );

    // Queued by the router if the link is still negotiating.
    let rx = engine.requests.register(&peer, chunk.id);
    let sent = engine.router.send(
        &peer,
        msg_types::CHUNK_REQUEST,
        &ChunkRequest {
            file_id: state.manifest.file_id.clone(),
            chunk_id: chunk.id,
        },
    );
    tracing::trace!(peer = %peer, chunk = %chunk.id.short(), index = chunk.index, "chunk requested");

    let chunk_id = chunk.id;
    let store = engine.store.clone();
    async move {
        let started = Instant::now();
        let reply = match sent {
            Ok(_) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(reply)) => Some(reply),
                Ok(Err(_)) => Some(ChunkReply::Disconnected),
                Err(_) => None,
            },
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "chunk request not sent");
                None
            }
        };
        let elapsed = started.elapsed();
        let fetched = match reply {
            Some(ChunkReply::Data(bytes)) => store_chunk(store, chunk_id, bytes).await,
            Some(ChunkReply::Unavailable) => Fetched::Unavailable,
            Some(ChunkReply::Disconnected) => Fetched::Disconnected,
            None => Fetched::TimedOut,
        };
        FetchOutcome {
            chunk: chunk_id,
            peer,
            fetched,
            elapsed,
        }
    }
    .boxed()
}

/// Hash and persist a received chunk on the blocking pool.
async fn store_chunk(store: ChunkStore, chunk: ChunkId, bytes: Bytes) -> Fetched {
    let len = bytes.len();
    match tokio::task::spawn_blocking(move || store.put_verified(&chunk, &bytes)).await {
        Ok(Ok(())) => Fetched::Stored(len),
        Ok(Err(StoreError::HashMismatch { .. })) => Fetched::Corrupt,
        Ok(Err(e)) => Fetched::StoreFailed(e.into()),
        Err(e) => Fetched::StoreFailed(e.into()),
    }
}

fn handle_outcome(
    engine: &Arc<EngineInner>,
    state: &mut TransferState,
    outcome: FetchOutcome,
    progress: &TransferProgress,
) -> Result<(), TransferError> {
    let FetchOutcome {
        chunk,
        peer,
        fetched,
        elapsed,
    } = outcome;
    let flight = state.in_flight.remove(&chunk);
    debug_assert!(flight.as_ref().map_or(true, |f| f.peer == peer));
    let file_id = &state.manifest.file_id;

    match fetched {
        Fetched::Stored(len) => {
            engine.scores.record_success(&peer, len, elapsed);
            if state.downloaded.insert(chunk) {
                progress
                    .downloaded
                    .store(state.downloaded.len(), Ordering::Relaxed);
                emit_progress(engine, state);
            }
            Ok(())
        }
        Fetched::Corrupt => {
            tracing::warn!(
                file = %file_id,
                peer = %peer,
                chunk = %chunk.short(),
                "chunk hash mismatch, discarding"
            );
            engine.scores.record_failure(&peer);
            failed_attempt(engine, state, &chunk)
        }
        Fetched::StoreFailed(e) => Err(e),
        Fetched::Unavailable => {
            tracing::debug!(file = %file_id, peer = %peer, chunk = %chunk.short(), "peer lacks chunk");
            state.mark_lacking(&chunk, &peer);
            engine.scores.record_failure(&peer);
            failed_attempt(engine, state, &chunk)
        }
        Fetched::Disconnected => {
            tracing::info!(file = %file_id, peer = %peer, "holder left, dropping from candidates");
            state.remove_candidate(&peer);
            Ok(())
        }
        Fetched::TimedOut => {
            let late_ms = flight
                .map(|f| f.deadline.elapsed().as_millis() as u64)
                .unwrap_or(0);
            tracing::debug!(file = %file_id, peer = %peer, chunk = %chunk.short(), late_ms, "chunk request timed out");
            engine.scores.record_failure(&peer);
            failed_attempt(engine, state, &chunk)
        }
    }
}

fn failed_attempt(
    engine: &Arc<EngineInner>,
    state: &mut TransferState,
    chunk: &ChunkId,
) -> Result<(), TransferError> {
    let attempts = state.record_failure(chunk);
    if attempts >= engine.settings.max_chunk_attempts {
        tracing::warn!(file = %state.manifest.file_id, chunk = %chunk.short(), attempts, "chunk attempts exhausted");
        return Err(TransferError::ChunkUnavailable {
            file_id: state.manifest.file_id.clone(),
            chunk_id: *chunk,
        });
    }
    Ok(())
}

fn emit_progress(engine: &EngineInner, state: &TransferState) {
    engine.events.emit(Event::DownloadProgress {
        file_id: state.manifest.file_id.clone(),
        fraction: state.fraction(),
        downloaded: state.downloaded.len(),
        total: state.total(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use pedia_core::{hash, FileId, TopicId};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn manifest(priorities: &[u8]) -> Arc<Manifest> {
        let chunks = priorities
            .iter()
            .enumerate()
            .map(|(i, &priority)| ChunkInfo {
                id: hash(&[i as u8]),
                index: i as u32,
                size: 1,
                priority,
            })
            .collect();
        Arc::new(Manifest {
            file_id: FileId::from("f"),
            name: "f".into(),
            size: priorities.len() as u64,
            mime_type: "application/octet-stream".into(),
            chunks,
            created: 0,
            sharer: PeerId::from("s"),
            topic_id: TopicId::from("t"),
        })
    }

    fn peers(ids: &[&str]) -> BTreeSet<PeerId> {
        ids.iter().map(|s| PeerId::from(*s)).collect()
    }

    #[tokio::test]
    async fn received_chunks_are_verified_before_storing() {
        let store = crate::chunk_store::tests::temp_store();
        let body = Bytes::from_static(b"chunk body");
        let id = hash(&body);

        let tampered = store_chunk(store.clone(), id, Bytes::from_static(b"other body")).await;
        assert!(matches!(tampered, Fetched::Corrupt));
        assert!(!store.has(&id));

        let stored = store_chunk(store.clone(), id, body).await;
        assert!(matches!(stored, Fetched::Stored(10)));
        assert!(store.has(&id));
    }

    #[test]
    fn next_chunk_prefers_priority_then_index() {
        let mut state = TransferState::new(manifest(&[0, 0, 2, 1, 2]), peers(&["a"]), Priority::Normal);
        let order: Vec<u32> = std::iter::from_fn(|| {
            let c = state.next_chunk()?.clone();
            state.downloaded.insert(c.id);
            Some(c.index)
        })
        .collect();
        assert_eq!(order, vec![2, 4, 3, 0, 1]);
    }

    #[test]
    fn in_flight_chunks_are_skipped() {
        let mut state = TransferState::new(manifest(&[0, 0]), peers(&["a"]), Priority::Normal);
        let first = state.next_chunk().unwrap().id;
        state.in_flight.insert(
            first,
            InFlight {
                peer: PeerId::from("a"),
                deadline: Instant::now(),
            },
        );
        assert_eq!(state.next_chunk().unwrap().index, 1);
    }

    #[test]
    fn round_robin_rotates_and_skips_lacking() {
        let mut state = TransferState::new(manifest(&[0, 0, 0]), peers(&["a", "b"]), Priority::Normal);
        let mut rng = StdRng::seed_from_u64(0);
        let c0 = state.manifest.chunks[0].id;
        let c1 = state.manifest.chunks[1].id;
        assert_eq!(state.choose_peer(&c0, None, &mut rng), Some(PeerId::from("a")));
        assert_eq!(state.choose_peer(&c1, None, &mut rng), Some(PeerId::from("b")));

        state.mark_lacking(&c0, &PeerId::from("a"));
        assert_eq!(state.choose_peer(&c0, None, &mut rng), Some(PeerId::from("b")));
        state.mark_lacking(&c0, &PeerId::from("b"));
        assert_eq!(state.choose_peer(&c0, None, &mut rng), None);
    }

    #[test]
    fn retries_prefer_untried_holders() {
        let mut state = TransferState::new(manifest(&[0]), peers(&["a", "b", "c"]), Priority::Normal);
        let scores = PeerScores::new();
        let mut rng = StdRng::seed_from_u64(3);
        let c = state.manifest.chunks[0].id;
        let mut seen = HashSet::new();
        for _ in 0..3 {
            seen.insert(state.choose_peer(&c, Some(&scores), &mut rng).unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn sole_holder_is_always_chosen() {
        let mut state = TransferState::new(manifest(&[0]), peers(&["only"]), Priority::Normal);
        let scores = PeerScores::new();
        for _ in 0..5 {
            scores.record_failure(&PeerId::from("only"));
        }
        let c = state.manifest.chunks[0].id;
        let mut rng = StdRng::seed_from_u64(9);
        assert_eq!(
            state.choose_peer(&c, Some(&scores), &mut rng),
            Some(PeerId::from("only"))
        );
    }

    #[test]
    fn fraction_counts_distinct_chunks() {
        let mut m = (*manifest(&[0, 0, 0])).clone();
        m.chunks[2].id = m.chunks[0].id;
        let mut state = TransferState::new(Arc::new(m), peers(&["a"]), Priority::Normal);
        assert_eq!(state.total(), 2);
        let id = state.manifest.chunks[0].id;
        state.downloaded.insert(id);
        assert_eq!(state.fraction(), 0.5);
    }

    #[test]
    fn attempts_accumulate() {
        let mut state = TransferState::new(manifest(&[0]), peers(&["a"]), Priority::Normal);
        let c = state.manifest.chunks[0].id;
        assert_eq!(state.record_failure(&c), 1);
        assert_eq!(state.record_failure(&c), 2);
    }

    #[test]
    fn fill_levels() {
        assert_eq!(Priority::Low.fill_level(5), 2);
        assert_eq!(Priority::Normal.fill_level(5), 5);
        assert_eq!(Priority::High.fill_level(5), 7);
        assert_eq!(Priority::Low.fill_level(1), 1);
    }
}
