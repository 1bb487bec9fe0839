//! File manifests: the ordered chunk list plus metadata for one shared file.

use serde::{Deserialize, Serialize};

use crate::crypto::{ChunkId, FileId};
use crate::ids::{PeerId, TopicId};

/// One entry in a manifest's chunk list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub id: ChunkId,
    pub index: u32,
    pub size: u32,
    /// Fetch priority, higher first. Absent on the wire means 0.
    #[serde(default)]
    pub priority: u8,
}

/// Describes one shareable file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub file_id: FileId,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub chunks: Vec<ChunkInfo>,
    /// Unix milliseconds.
    pub created: u64,
    pub sharer: PeerId,
    pub topic_id: TopicId,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("chunk sizes sum to {actual}, manifest declares {declared}")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("chunk at position {position} has index {index}")]
    IndexGap { position: usize, index: u32 },
}

impl Manifest {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.chunks.iter().map(|c| c.id)
    }

    pub fn contains(&self, id: &ChunkId) -> bool {
        self.chunks.iter().any(|c| c.id == *id)
    }

    /// Check the structural invariants a received manifest must satisfy
    /// before a download is attempted: contiguous indices starting at 0
    /// and chunk sizes adding up to the file size.
    pub fn validate(&self) -> Result<(), ManifestError> {
        for (position, chunk) in self.chunks.iter().enumerate() {
            if chunk.index as usize != position {
                return Err(ManifestError::IndexGap {
                    position,
                    index: chunk.index,
                });
            }
        }
        let actual: u64 = self.chunks.iter().map(|c| c.size as u64).sum();
        if actual != self.size {
            return Err(ManifestError::SizeMismatch {
                declared: self.size,
                actual,
            });
        }
        Ok(())
    }
}
