//! Content hashing.
//!
//! Every chunk is addressed by the BLAKE3 digest of its own bytes. The same
//! digest function derives file ids, so two nodes that chunk identical input
//! with identical metadata agree on every identifier without coordination.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning the chunk id of those bytes.
pub fn hash(data: &[u8]) -> ChunkId {
    ChunkId(*blake3::hash(data).as_bytes())
}

// ── ChunkId ──────────────────────────────────────────────────────────────────

/// Content address of a chunk: `blake3(bytes)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub [u8; 32]);

impl ChunkId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full lowercase hex encoding (64 chars).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 bytes as hex, for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// True when `data` hashes to this id.
    pub fn verify(&self, data: &[u8]) -> bool {
        hash(data) == *self
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self.short())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    #[error("invalid hex: {0}")]
    Hex(String),
    #[error("expected 32 bytes, got {0}")]
    Length(usize),
}

impl FromStr for ChunkId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| IdParseError::Hex(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IdParseError::Length(bytes.len()))?;
        Ok(ChunkId(arr))
    }
}

impl Serialize for ChunkId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChunkId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── FileId ───────────────────────────────────────────────────────────────────

/// Identifier of a shared file (hex digest, see [`FileId::derive`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub String);

impl FileId {
    /// Derive a file id from the manifest contents.
    ///
    /// Covers the sharer, name, size, creation time and the ordered chunk
    /// list, so re-sharing the same bytes later yields a new file id while
    /// the chunks themselves stay deduplicated.
    pub fn derive(
        sharer: &str,
        name: &str,
        size: u64,
        created_ms: u64,
        chunks: impl IntoIterator<Item = ChunkId>,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(sharer.as_bytes());
        hasher.update(&[0]);
        hasher.update(name.as_bytes());
        hasher.update(&[0]);
        hasher.update(&size.to_le_bytes());
        hasher.update(&created_ms.to_le_bytes());
        for id in chunks {
            hasher.update(id.as_bytes());
        }
        FileId(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(s: &str) -> Self {
        FileId(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash(b"pedia"), hash(b"pedia"));
        assert_ne!(hash(b"pedia"), hash(b"pedia!"));
    }

    #[test]
    fn verify_detects_tampering() {
        let id = hash(b"chunk bytes");
        assert!(id.verify(b"chunk bytes"));
        assert!(!id.verify(b"chunk bytez"));
    }

    #[test]
    fn chunk_id_hex_parse() {
        let id = hash(b"abc");
        let parsed: ChunkId = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("zz".parse::<ChunkId>().is_err());
        assert_eq!("abcd".parse::<ChunkId>(), Err(IdParseError::Length(2)));
    }

    #[test]
    fn chunk_id_serializes_as_hex_string() {
        let id = hash(b"abc");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
    }

    #[test]
    fn file_id_depends_on_chunk_order() {
        let a = hash(b"a");
        let b = hash(b"b");
        let one = FileId::derive("peer", "f.txt", 2, 1, [a, b]);
        let two = FileId::derive("peer", "f.txt", 2, 1, [b, a]);
        let again = FileId::derive("peer", "f.txt", 2, 1, [a, b]);
        assert_ne!(one, two);
        assert_eq!(one, again);
    }
}
