//! Content-addressed chunk store.
//!
//! Chunks are stored by content hash in a two-level directory structure:
//!   {root}/{hash[0..2]}/{full_hash}
//!
//! A chunk file exists only if its bytes hash to its name. Identical chunks
//! from different files share one entry, and storing an existing chunk is
//! a no-op.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use memmap2::Mmap;
use pedia_core::{hash, ChunkId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("chunk hash mismatch: expected {expected:?}, got {actual:?}")]
    HashMismatch { expected: ChunkId, actual: ChunkId },

    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> StoreError + 'a {
    move |source| StoreError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// Distinguishes concurrent temp files for the same chunk.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err("create", &root))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn has(&self, id: &ChunkId) -> bool {
        self.chunk_path(id).exists()
    }

    /// Retrieve a chunk. `None` if absent.
    pub fn get(&self, id: &ChunkId) -> Result<Option<Bytes>, StoreError> {
        let path = self.chunk_path(id);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err("open", &path)(e)),
        };

        let len = file.metadata().map_err(io_err("stat", &path))?.len();
        if len == 0 {
            return Ok(Some(Bytes::new()));
        }

        // Safety: chunk files are never modified after the rename in put.
        let mmap = unsafe { Mmap::map(&file).map_err(io_err("mmap", &path))? };
        Ok(Some(Bytes::copy_from_slice(&mmap)))
    }

    /// Hash and store `data`, returning its id.
    pub fn put(&self, data: &[u8]) -> Result<ChunkId, StoreError> {
        let id = hash(data);
        self.write(&id, data)?;
        Ok(id)
    }

    /// Store `data` under `expected`, refusing bytes that hash elsewhere.
    pub fn put_verified(&self, expected: &ChunkId, data: &[u8]) -> Result<(), StoreError> {
        let actual = hash(data);
        if actual != *expected {
            return Err(StoreError::HashMismatch {
                expected: *expected,
                actual,
            });
        }
        self.write(expected, data)
    }

    /// Delete a chunk. Returns true if it was present.
    pub fn remove(&self, id: &ChunkId) -> Result<bool, StoreError> {
        let path = self.chunk_path(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err("remove", &path)(e)),
        }
    }

    /// Every stored chunk id. Stray files that are not chunk names are skipped.
    pub fn ids(&self) -> Vec<ChunkId> {
        let mut out = Vec::new();
        for path in self.chunk_files() {
            if let Some(id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<ChunkId>().ok())
            {
                out.push(id);
            }
        }
        out
    }

    /// Remove every chunk for which `keep` returns false. Returns the
    /// number of chunks removed.
    pub fn retain(&self, mut keep: impl FnMut(&ChunkId) -> bool) -> Result<usize, StoreError> {
        let mut removed = 0;
        for id in self.ids() {
            if !keep(&id) && self.remove(&id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn count(&self) -> usize {
        self.ids().len()
    }

    /// Total stored bytes.
    pub fn size(&self) -> u64 {
        self.chunk_files()
            .iter()
            .filter_map(|p| p.metadata().ok())
            .map(|m| m.len())
            .sum()
    }

    pub fn clear(&self) {
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                let _ = fs::remove_dir_all(entry.path());
            }
        }
    }

    fn write(&self, id: &ChunkId, data: &[u8]) -> Result<(), StoreError> {
        let path = self.chunk_path(id);
        if path.exists() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err("create", parent))?;
        }

        // Atomic write: tmp file → rename
        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_path = path.with_extension(format!("{}-{}.tmp", std::process::id(), n));
        {
            let mut file = fs::File::create(&tmp_path).map_err(io_err("create", &tmp_path))?;
            file.write_all(data).map_err(io_err("write", &tmp_path))?;
            file.sync_all().map_err(io_err("sync", &tmp_path))?;
        }
        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(io_err("rename", &path)(e));
        }

        tracing::trace!(chunk = %id.short(), bytes = data.len(), "chunk stored");
        Ok(())
    }

    fn chunk_path(&self, id: &ChunkId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(&hex[0..2]).join(&hex)
    }

    fn chunk_files(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                if let Ok(subdir) = fs::read_dir(entry.path()) {
                    for chunk in subdir.flatten() {
                        let path = chunk.path();
                        if path.extension().is_none() {
                            out.push(path);
                        }
                    }
                }
            }
        }
        out
    }
}
