//! pedia-services: the runtime half of pedia: signaling, peer links, the
//! message router, the chunk store and the distribution engine.

pub mod chunk_store;
pub mod distribution;
pub mod events;
pub mod link;
pub mod manifest_store;
pub mod node;
pub mod router;
pub mod signaling;
pub mod topics;
pub mod transport;

pub use chunk_store::{ChunkStore, StoreError};
pub use distribution::{
    DistributionEngine, DownloadOptions, EngineSettings, Priority, ShareOptions, TransferError,
    TransferSummary,
};
pub use events::{Event, EventBus};
pub use link::{LinkError, LinkSettings, LinkState, PeerLinkManager};
pub use manifest_store::{JsonManifestStore, ManifestStore, MemoryManifestStore};
pub use node::Node;
pub use router::{MessageRouter, SendStatus};
pub use signaling::{LocalRelay, RelayServer, SignalingClient, TcpSignaling};
pub use topics::{MemoryTopics, TopicDirectory};
pub use transport::{Connector, MemoryConnector, TcpConnector};
