//! Distribution engine: shares files as content-addressed chunks and
//! downloads them from whichever topic peers hold them.
//!
//! Outbound: chunk, store, persist the manifest, announce `file-available`.
//! Inbound: a per-transfer fetch loop ([`transfer`]) pulls chunks from
//! candidate holders with bounded concurrency, verifies every chunk
//! against its id and assembles the file once all are present.

pub mod policy;
mod requests;
pub mod scoring;
mod transfer;


use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use pedia_core::config::{DistributionConfig, StorageConfig};
use pedia_core::manifest::ManifestError;
use pedia_core::wire::{
    decode_chunk_data, encode_chunk_data, msg_types, Channel, ChunkRequest, ChunkUnavailable,
    Envelope, FileAvailable,
};
use pedia_core::{ChunkId, ChunkInfo, FileId, Manifest, PeerId, TopicId};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};

use crate::chunk_store::{ChunkStore, StoreError};
use crate::events::{Event, EventBus};
use crate::link::PeerLinkManager;
use crate::manifest_store::{ManifestStore, ManifestStoreError};
use crate::router::{now_ms, BulkHandler, MessageHandler, MessageRouter};
use crate::topics::TopicDirectory;

use policy::{chunk_priority, mime_for, AdaptiveChunkSize, Category, ChunkSizePolicy, FixedChunkSize};
use requests::{ChunkReply, ChunkRequests};
use scoring::{announcement_width, PeerScores};
use transfer::{TransferControl, TransferProgress, TransferSignals, TransferState};

pub use transfer::Priority;

// ── Settings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub chunk_size: usize,
    pub adaptive_chunking: bool,
    /// Fill level K of each transfer's fetch loop.
    pub max_concurrent_fetches: usize,
    pub max_chunk_attempts: u32,
    pub chunk_timeout: Duration,
    pub peer_scoring: bool,
    /// Where downloads land when no destination is given.
    pub download_dir: PathBuf,
}

impl EngineSettings {
    pub fn from_config(distribution: &DistributionConfig, storage: &StorageConfig) -> Self {
        Self {
            chunk_size: distribution.chunk_size,
            adaptive_chunking: distribution.adaptive_chunking,
            max_concurrent_fetches: distribution.max_concurrent_fetches,
            max_chunk_attempts: distribution.max_chunk_attempts,
            chunk_timeout: Duration::from_secs(distribution.chunk_timeout_secs),
            peer_scoring: distribution.peer_scoring,
            download_dir: storage.download_dir.clone(),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&DistributionConfig::default(), &StorageConfig::default())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("manifest not found: {0}")]
    ManifestNotFound(FileId),

    #[error("manifest for {file_id} is invalid: {source}")]
    InvalidManifest {
        file_id: FileId,
        #[source]
        source: ManifestError,
    },

    #[error("chunk {chunk_id} of {file_id} is unavailable from every known holder")]
    ChunkUnavailable { file_id: FileId, chunk_id: ChunkId },

    #[error("transfer of {0} was cancelled")]
    Cancelled(FileId),

    #[error("a transfer of {0} is already active")]
    TransferActive(FileId),

    #[error("no active transfer for {0}")]
    TransferNotFound(FileId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Manifests(#[from] ManifestStoreError),

    #[error("failed to assemble {path}: {source}")]
    Assemble {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("blocking store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

// ── Options and status ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ShareOptions {
    pub name: String,
    /// Guessed from the name when absent.
    pub mime_type: Option<String>,
}

impl ShareOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mime_type: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Defaults to the download directory plus the manifest's file name.
    pub destination: Option<PathBuf>,
    pub priority: Priority,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferSummary {
    pub file_id: FileId,
    pub name: String,
    pub destination: PathBuf,
    pub downloaded: usize,
    pub total: usize,
    pub fraction: f64,
    pub paused: bool,
    pub priority: Priority,
    pub elapsed_ms: u64,
}

struct TransferHandle {
    /// Distinguishes this run from a later download of the same file.
    token: u64,
    manifest: Arc<Manifest>,
    destination: PathBuf,
    priority: Priority,
    control: watch::Sender<TransferControl>,
    departures: mpsc::UnboundedSender<PeerId>,
    progress: Arc<TransferProgress>,
    started: Instant,
}

impl TransferHandle {
    fn summary(&self) -> TransferSummary {
        let downloaded = self.progress.downloaded.load(Ordering::Relaxed);
        let total = self.progress.total.load(Ordering::Relaxed);
        TransferSummary {
            file_id: self.manifest.file_id.clone(),
            name: self.manifest.name.clone(),
            destination: self.destination.clone(),
            downloaded,
            total,
            fraction: if total == 0 {
                0.0
            } else {
                downloaded as f64 / total as f64
            },
            paused: *self.control.borrow() == TransferControl::Paused,
            priority: self.priority,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub(crate) struct EngineInner {
    local: PeerId,
    settings: EngineSettings,
    router: MessageRouter,
    links: PeerLinkManager,
    store: ChunkStore,
    manifests: Arc<dyn ManifestStore>,
    topics: Arc<dyn TopicDirectory>,
    events: EventBus,
    policy: Box<dyn ChunkSizePolicy>,
    scores: PeerScores,
    /// Peers that announced each file.
    holders: DashMap<FileId, HashSet<PeerId>>,
    /// Files whose chunks are all held locally (shared or downloaded).
    local_files: DashSet<FileId>,
    transfers: DashMap<FileId, TransferHandle>,
    requests: ChunkRequests,
    next_transfer: AtomicU64,
}

#[derive(Clone)]
pub struct DistributionEngine {
    inner: Arc<EngineInner>,
}

impl DistributionEngine {
    /// Build the engine and register its handlers on `router`. Must be
    /// called inside a tokio runtime.
    pub fn new(
        settings: EngineSettings,
        router: MessageRouter,
        store: ChunkStore,
        manifests: Arc<dyn ManifestStore>,
        topics: Arc<dyn TopicDirectory>,
        events: EventBus,
    ) -> Self {
        let policy: Box<dyn ChunkSizePolicy> = if settings.adaptive_chunking {
            Box::new(AdaptiveChunkSize)
        } else {
            Box::new(FixedChunkSize)
        };
        let links = router.links().clone();
        let inner = Arc::new(EngineInner {
            local: links.local_id().clone(),
            settings,
            router,
            links,
            store,
            manifests,
            topics,
            events,
            policy,
            scores: PeerScores::new(),
            holders: DashMap::new(),
            local_files: DashSet::new(),
            transfers: DashMap::new(),
            requests: ChunkRequests::default(),
            next_transfer: AtomicU64::new(1),
        });

        inner.load_local_files();

        let handler = Arc::new(Inbound {
            engine: Arc::downgrade(&inner),
        });
        for msg_type in [
            msg_types::FILE_AVAILABLE,
            msg_types::CHUNK_REQUEST,
            msg_types::CHUNK_UNAVAILABLE,
        ] {
            inner.router.register(msg_type, handler.clone());
        }
        inner.router.set_bulk_handler(handler);

        tokio::spawn(watch_departures(
            Arc::downgrade(&inner),
            inner.events.subscribe(),
        ));

        Self { inner }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.inner.local
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> &ChunkStore {
        &self.inner.store
    }

    pub fn manifests(&self) -> &Arc<dyn ManifestStore> {
        &self.inner.manifests
    }

    pub fn scores(&self) -> &PeerScores {
        &self.inner.scores
    }

    /// Split `data` into chunks, store them, persist the manifest and
    /// announce it to connected members of `topic`. Returns once the
    /// manifest is persisted; announcements go out through the router.
    pub fn share_file(
        &self,
        data: &[u8],
        topic: &TopicId,
        options: ShareOptions,
    ) -> Result<FileId, TransferError> {
        let inner = &self.inner;
        let ShareOptions { name, mime_type } = options;
        let mime_type = mime_type.unwrap_or_else(|| mime_for(&name));
        let category = Category::of(&name, &mime_type);
        let size = data.len() as u64;
        let chunk_size = inner
            .policy
            .chunk_size(inner.settings.chunk_size, size, category)
            .max(1);
        let total = data.len().div_ceil(chunk_size);

        let mut chunks = Vec::with_capacity(total);
        for (index, piece) in data.chunks(chunk_size).enumerate() {
            let id = inner.store.put(piece)?;
            chunks.push(ChunkInfo {
                id,
                index: index as u32,
                size: piece.len() as u32,
                priority: chunk_priority(index, total, category),
            });
        }

        let created = now_ms();
        let file_id = FileId::derive(
            inner.local.as_str(),
            &name,
            size,
            created,
            chunks.iter().map(|c| c.id),
        );
        let manifest = Manifest {
            file_id: file_id.clone(),
            name,
            size,
            mime_type,
            chunks,
            created,
            sharer: inner.local.clone(),
            topic_id: topic.clone(),
        };
        inner.manifests.store_manifest(&manifest)?;
        inner.local_files.insert(file_id.clone());

        tracing::info!(
            file = %file_id,
            name = %manifest.name,
            bytes = size,
            chunks = manifest.chunk_count(),
            chunk_size,
            category = ?category,
            "file shared"
        );

        let peer_count = inner.announce(&manifest);
        inner.events.emit(Event::FileShared {
            file_id: file_id.clone(),
            peer_count,
        });
        Ok(file_id)
    }

    /// Fetch every chunk of `file_id` and write the file. Resolves when the
    /// transfer completes, fails or is cancelled.
    pub async fn download_file(
        &self,
        file_id: &FileId,
        options: DownloadOptions,
    ) -> Result<PathBuf, TransferError> {
        let inner = &self.inner;
        let manifest = inner
            .manifests
            .get_manifest(file_id)?
            .ok_or_else(|| TransferError::ManifestNotFound(file_id.clone()))?;
        manifest
            .validate()
            .map_err(|source| TransferError::InvalidManifest {
                file_id: file_id.clone(),
                source,
            })?;
        let manifest = Arc::new(manifest);
        let destination = options
            .destination
            .unwrap_or_else(|| inner.settings.download_dir.join(safe_file_name(&manifest.name)));

        let (control, control_rx) = watch::channel(TransferControl::Running);
        let (departures, departures_rx) = mpsc::unbounded_channel();
        let progress = Arc::new(TransferProgress::default());
        let token = inner.next_transfer.fetch_add(1, Ordering::Relaxed);
        match inner.transfers.entry(file_id.clone()) {
            Entry::Occupied(_) => return Err(TransferError::TransferActive(file_id.clone())),
            Entry::Vacant(v) => {
                v.insert(TransferHandle {
                    token,
                    manifest: manifest.clone(),
                    destination: destination.clone(),
                    priority: options.priority,
                    control,
                    departures,
                    progress: progress.clone(),
                    started: Instant::now(),
                });
            }
        }
        let _guard = TransferGuard {
            engine: inner.clone(),
            file_id: file_id.clone(),
            token,
        };

        let mut signals = TransferSignals {
            control: control_rx,
            departures: departures_rx,
        };
        let result = inner
            .run_transfer(manifest, options.priority, destination, token, &mut signals, &progress)
            .await;
        if let Err(e) = &result {
            tracing::warn!(file = %file_id, error = %e, "download failed");
            inner.events.emit(Event::DownloadError {
                file_id: file_id.clone(),
                error: e.to_string(),
            });
        }
        result
    }

    /// Stop scheduling new fetches; in-flight ones still land.
    pub fn pause(&self, file_id: &FileId) -> Result<(), TransferError> {
        self.inner.set_control(file_id, TransferControl::Paused)?;
        tracing::info!(file = %file_id, "transfer paused");
        Ok(())
    }

    pub fn resume(&self, file_id: &FileId) -> Result<(), TransferError> {
        self.inner.set_control(file_id, TransferControl::Running)?;
        tracing::info!(file = %file_id, "transfer resumed");
        Ok(())
    }

    /// Drop the transfer. Fetched chunks stay in the store until the next
    /// [`collect_garbage`](Self::collect_garbage).
    pub fn cancel(&self, file_id: &FileId) -> Result<(), TransferError> {
        let (_, handle) = self
            .inner
            .transfers
            .remove(file_id)
            .ok_or_else(|| TransferError::TransferNotFound(file_id.clone()))?;
        handle.control.send_replace(TransferControl::Cancelled);
        tracing::info!(file = %file_id, "transfer cancelled");
        Ok(())
    }

    pub fn active_transfers(&self) -> Vec<TransferSummary> {
        let mut out: Vec<_> = self.inner.transfers.iter().map(|t| t.summary()).collect();
        out.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        out
    }

    pub fn transfer_progress(&self, file_id: &FileId) -> Option<TransferSummary> {
        self.inner.transfers.get(file_id).map(|t| t.summary())
    }

    /// Peers that announced `file_id`.
    pub fn holders(&self, file_id: &FileId) -> Vec<PeerId> {
        let mut out: Vec<_> = self
            .inner
            .holders
            .get(file_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    pub fn local_files(&self) -> Vec<FileId> {
        let mut out: Vec<_> = self.inner.local_files.iter().map(|f| f.clone()).collect();
        out.sort();
        out
    }

    /// Delete chunks referenced by neither a local file nor an active
    /// transfer. Returns how many were removed.
    pub fn collect_garbage(&self) -> Result<usize, TransferError> {
        let inner = &self.inner;
        let mut keep: HashSet<ChunkId> = HashSet::new();
        let local: Vec<FileId> = inner.local_files.iter().map(|f| f.clone()).collect();
        for file_id in local {
            if let Some(manifest) = inner.manifests.get_manifest(&file_id)? {
                keep.extend(manifest.chunk_ids());
            }
        }
        for transfer in inner.transfers.iter() {
            keep.extend(transfer.manifest.chunk_ids());
        }
        let removed = inner.store.retain(|id| keep.contains(id))?;
        tracing::info!(removed, kept = keep.len(), "chunk store collected");
        Ok(removed)
    }
}

impl EngineInner {
    /// Rebuild the local file set from manifests whose chunks are all on disk.
    fn load_local_files(&self) {
        match self.manifests.list_manifests() {
            Ok(manifests) => {
                for manifest in manifests {
                    if manifest.chunk_ids().all(|id| self.store.has(&id)) {
                        self.local_files.insert(manifest.file_id);
                    }
                }
                if !self.local_files.is_empty() {
                    tracing::info!(files = self.local_files.len(), "local files restored");
                }
            }
            Err(e) => tracing::warn!(error = %e, "could not list manifests"),
        }
    }

    /// Send `file-available` to the selected members of the manifest's
    /// topic. Returns how many peers it went to.
    fn announce(&self, manifest: &Manifest) -> usize {
        let mut targets: Vec<PeerId> = self
            .topics
            .get_topic_members(&manifest.topic_id)
            .into_iter()
            .filter(|p| *p != self.local && self.links.is_connected(p))
            .collect();
        targets.sort();
        if self.settings.peer_scoring {
            let width = announcement_width(targets.len());
            targets = self.scores.rank(targets);
            targets.truncate(width);
        }

        let message = FileAvailable {
            manifest: manifest.clone(),
        };
        let mut sent = 0;
        for peer in &targets {
            match self.router.send(peer, msg_types::FILE_AVAILABLE, &message) {
                Ok(_) => sent += 1,
                Err(e) => {
                    tracing::warn!(peer = %peer, file = %manifest.file_id, error = %e, "announcement failed")
                }
            }
        }
        tracing::debug!(file = %manifest.file_id, peers = sent, "file announced");
        sent
    }

    async fn run_transfer(
        self: &Arc<Self>,
        manifest: Arc<Manifest>,
        priority: Priority,
        destination: PathBuf,
        token: u64,
        signals: &mut TransferSignals,
        progress: &TransferProgress,
    ) -> Result<PathBuf, TransferError> {
        let file_id = manifest.file_id.clone();
        let mut candidates: BTreeSet<PeerId> = self
            .holders
            .get(&file_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default();
        candidates.insert(manifest.sharer.clone());
        candidates.remove(&self.local);

        tracing::info!(
            file = %file_id,
            name = %manifest.name,
            chunks = manifest.chunk_count(),
            candidates = candidates.len(),
            "download started"
        );
        let mut state = TransferState::new(manifest.clone(), candidates, priority);
        transfer::fetch_all(self, &mut state, signals, progress).await?;

        // A cancel that raced the last chunk still wins.
        let current = self
            .transfers
            .get(&file_id)
            .map(|t| t.token == token)
            .unwrap_or(false);
        if !current {
            return Err(TransferError::Cancelled(file_id));
        }

        let store = self.store.clone();
        let (to_write, target) = (manifest.clone(), destination.clone());
        tokio::task::spawn_blocking(move || assemble(&store, &to_write, &target)).await??;
        self.local_files.insert(file_id.clone());

        let elapsed = state.started.elapsed();
        let throughput = manifest.size as f64 / elapsed.as_secs_f64().max(1e-3);
        tracing::info!(
            file = %file_id,
            bytes = manifest.size,
            elapsed_ms = elapsed.as_millis() as u64,
            path = %destination.display(),
            "download complete"
        );
        self.events.emit(Event::DownloadComplete {
            file_id,
            path: destination.clone(),
            elapsed_ms: elapsed.as_millis() as u64,
            throughput,
        });
        Ok(destination)
    }

    fn set_control(&self, file_id: &FileId, control: TransferControl) -> Result<(), TransferError> {
        let handle = self
            .transfers
            .get(file_id)
            .ok_or_else(|| TransferError::TransferNotFound(file_id.clone()))?;
        handle.control.send_replace(control);
        Ok(())
    }

    // ── Inbound messages ──────────────────────────────────────────────────────

    fn on_file_available(&self, peer: &PeerId, message: FileAvailable) -> anyhow::Result<()> {
        let manifest = message.manifest;
        manifest.validate()?;
        if !self.topics.is_member(&manifest.topic_id, peer) {
            tracing::debug!(
                peer = %peer,
                file = %manifest.file_id,
                topic = %manifest.topic_id,
                "announcement from non-member ignored"
            );
            return Ok(());
        }
        let file_id = manifest.file_id.clone();
        // Holder first: anyone who sees the manifest can also see its source.
        self.holders
            .entry(file_id.clone())
            .or_default()
            .insert(peer.clone());
        if self.manifests.get_manifest(&file_id)?.is_none() {
            self.manifests.store_manifest(&manifest)?;
            tracing::info!(peer = %peer, file = %file_id, name = %manifest.name, "file announced to us");
        }
        Ok(())
    }

    /// Serve a chunk off the router's dispatch task: the store read runs on
    /// the blocking pool and the reply goes out when it completes.
    fn on_chunk_request(self: &Arc<Self>, peer: &PeerId, request: ChunkRequest) {
        let engine = self.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.serve_chunk(&peer, request).await {
                tracing::warn!(peer = %peer, error = %e, "chunk request handling failed");
            }
        });
    }

    async fn serve_chunk(&self, peer: &PeerId, request: ChunkRequest) -> anyhow::Result<()> {
        if self.links.channel_ready(peer, Channel::Bulk) {
            let store = self.store.clone();
            let chunk_id = request.chunk_id;
            let frame = tokio::task::spawn_blocking(move || {
                store
                    .get(&chunk_id)
                    .map(|found| found.map(|bytes| encode_chunk_data(&chunk_id, &bytes)))
            })
            .await??;
            if let Some(frame) = frame {
                let bytes = frame.len();
                match self.links.send_bulk(peer, frame) {
                    Ok(()) => {
                        tracing::trace!(peer = %peer, chunk = %chunk_id.short(), bytes, "chunk served");
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::debug!(peer = %peer, chunk = %chunk_id.short(), error = %e, "bulk send failed")
                    }
                }
            }
        }
        self.router.send(
            peer,
            msg_types::CHUNK_UNAVAILABLE,
            &ChunkUnavailable {
                file_id: request.file_id,
                chunk_id: request.chunk_id,
            },
        )?;
        Ok(())
    }
}

/// Concatenate chunks by index into `destination` via a temp file.
/// Blocking; runs on the blocking pool.
fn assemble(store: &ChunkStore, manifest: &Manifest, destination: &Path) -> Result<(), TransferError> {
    let io_err = |source| TransferError::Assemble {
        path: destination.to_path_buf(),
        source,
    };
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut tmp = destination.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);

    let mut out = BufWriter::new(File::create(&tmp).map_err(io_err)?);
    for chunk in &manifest.chunks {
        let bytes = store
            .get(&chunk.id)?
            .ok_or_else(|| TransferError::ChunkUnavailable {
                file_id: manifest.file_id.clone(),
                chunk_id: chunk.id,
            })?;
        out.write_all(&bytes).map_err(io_err)?;
    }
    let file = out.into_inner().map_err(|e| io_err(e.into_error()))?;
    file.sync_all().map_err(io_err)?;
    drop(file);

    let written = fs::metadata(&tmp).map_err(io_err)?.len();
    if written != manifest.size {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("assembled {written} bytes, manifest declares {}", manifest.size),
        )));
    }
    fs::rename(&tmp, destination).map_err(io_err)?;
    Ok(())
}

/// Removes the transfer entry when a download ends, however it ends.
struct TransferGuard {
    engine: Arc<EngineInner>,
    file_id: FileId,
    token: u64,
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        let token = self.token;
        let engine = &self.engine;
        engine.transfers.remove_if(&self.file_id, |_, t| t.token == token);
        engine.requests.prune();

        // Requests still waiting on a link would be served to nobody.
        if !engine.transfers.contains_key(&self.file_id) {
            let file_id = &self.file_id;
            let dropped = engine.router.discard_pending(|_, m| {
                m.msg_type == msg_types::CHUNK_REQUEST
                    && ChunkRequest::deserialize(&m.data)
                        .map(|r| r.file_id == *file_id)
                        .unwrap_or(false)
            });
            if dropped > 0 {
                tracing::debug!(file = %file_id, dropped, "queued chunk requests discarded");
            }
        }
    }
}

/// Router-facing side of the engine. Holds a weak reference so the router
/// does not keep the engine alive.
struct Inbound {
    engine: Weak<EngineInner>,
}

impl Inbound {
    fn engine(&self) -> anyhow::Result<Arc<EngineInner>> {
        self.engine
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("distribution engine dropped"))
    }
}

impl MessageHandler for Inbound {
    fn handle_message(&self, peer: &PeerId, envelope: &Envelope) -> anyhow::Result<()> {
        let engine = self.engine()?;
        match envelope.msg_type.as_str() {
            msg_types::FILE_AVAILABLE => engine.on_file_available(peer, envelope.payload()?),
            msg_types::CHUNK_REQUEST => {
                engine.on_chunk_request(peer, envelope.payload()?);
                Ok(())
            }
            msg_types::CHUNK_UNAVAILABLE => {
                let reply: ChunkUnavailable = envelope.payload()?;
                engine
                    .requests
                    .resolve(peer, reply.chunk_id, ChunkReply::Unavailable);
                Ok(())
            }
            other => anyhow::bail!("unexpected message type {other}"),
        }
    }
}

impl BulkHandler for Inbound {
    fn handle_bulk(&self, peer: &PeerId, payload: &[u8]) -> anyhow::Result<()> {
        let engine = self.engine()?;
        let (chunk_id, data) = decode_chunk_data(payload)?;
        let data = Bytes::copy_from_slice(data);
        if !engine.requests.resolve(peer, chunk_id, ChunkReply::Data(data)) {
            tracing::trace!(peer = %peer, chunk = %chunk_id.short(), "unsolicited chunk data dropped");
        }
        Ok(())
    }
}

/// Fail outstanding requests to departed peers and drop them from running
/// transfers.
async fn watch_departures(engine: Weak<EngineInner>, mut events: broadcast::Receiver<Event>) {
    loop {
        let (peer, gone) = match events.recv().await {
            Ok(Event::PeerRemoved { peer_id }) => (peer_id, false),
            Ok(Event::PeerGone { peer_id }) => (peer_id, true),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "distribution engine lagged behind peer events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(engine) = engine.upgrade() else { break };
        let failed = engine.requests.fail_peer(&peer);
        for transfer in engine.transfers.iter() {
            let _ = transfer.departures.send(peer.clone());
        }
        // No more reconnects: nothing queued for the peer can go out.
        let dropped = if gone { engine.router.clear_pending(&peer) } else { 0 };
        tracing::debug!(
            peer = %peer,
            failed,
            dropped,
            outstanding = engine.requests.len(),
            "peer departed"
        );
    }
}

/// Last path component of a remote-supplied name, never empty or a
/// directory reference.
fn safe_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    match cleaned.as_str() {
        "" | "." | ".." => "download".to_string(),
        _ => cleaned,
    }
}
