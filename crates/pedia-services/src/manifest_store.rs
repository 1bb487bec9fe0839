//! Manifest persistence.
//!
//! The distribution engine only needs store/get/list. Two backends: an
//! in-memory map for tests and ephemeral nodes, and a directory of JSON
//! files (one per file id) for the daemon.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use pedia_core::{FileId, Manifest};

#[derive(Debug, thiserror::Error)]
pub enum ManifestStoreError {
    #[error("manifest io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("manifest json at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub trait ManifestStore: Send + Sync {
    fn store_manifest(&self, manifest: &Manifest) -> Result<(), ManifestStoreError>;

    fn get_manifest(&self, file_id: &FileId) -> Result<Option<Manifest>, ManifestStoreError>;

    fn list_manifests(&self) -> Result<Vec<Manifest>, ManifestStoreError>;
}

// ── Memory ────────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct MemoryManifestStore {
    manifests: Arc<DashMap<FileId, Manifest>>,
}

impl MemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ManifestStore for MemoryManifestStore {
    fn store_manifest(&self, manifest: &Manifest) -> Result<(), ManifestStoreError> {
        self.manifests
            .insert(manifest.file_id.clone(), manifest.clone());
        Ok(())
    }

    fn get_manifest(&self, file_id: &FileId) -> Result<Option<Manifest>, ManifestStoreError> {
        Ok(self.manifests.get(file_id).map(|m| m.clone()))
    }

    fn list_manifests(&self) -> Result<Vec<Manifest>, ManifestStoreError> {
        Ok(self.manifests.iter().map(|e| e.value().clone()).collect())
    }
}

// ── JSON directory ────────────────────────────────────────────────────────────

pub struct JsonManifestStore {
    dir: PathBuf,
}

impl JsonManifestStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ManifestStoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| ManifestStoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, file_id: &FileId) -> PathBuf {
        // File ids are hex digests locally, but announcements come from
        // remote peers; keep only filename-safe characters.
        let safe: String = file_id
            .as_str()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    fn read(path: &Path) -> Result<Manifest, ManifestStoreError> {
        let text = fs::read_to_string(path).map_err(|source| ManifestStoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ManifestStoreError::Json {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl ManifestStore for JsonManifestStore {
    fn store_manifest(&self, manifest: &Manifest) -> Result<(), ManifestStoreError> {
        let path = self.path_for(&manifest.file_id);
        let json =
            serde_json::to_vec_pretty(manifest).map_err(|source| ManifestStoreError::Json {
                path: path.clone(),
                source,
            })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|source| ManifestStoreError::Io { path, source })
    }

    fn get_manifest(&self, file_id: &FileId) -> Result<Option<Manifest>, ManifestStoreError> {
        let path = self.path_for(file_id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    fn list_manifests(&self) -> Result<Vec<Manifest>, ManifestStoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| ManifestStoreError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path) {
                Ok(m) => out.push(m),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable manifest"),
            }
        }
        Ok(out)
    }
}
