//! pedia-core: shared identifiers, content hashing, manifests, the link
//! frame codec and configuration. All other pedia crates depend on this one.

pub mod config;
pub mod crypto;
pub mod ids;
pub mod manifest;
pub mod wire;

pub use crypto::{hash, ChunkId, FileId};
pub use ids::{PeerId, TopicId};
pub use manifest::{ChunkInfo, Manifest};
