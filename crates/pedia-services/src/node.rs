//! One running pedia node: links, router and engine wired over a shared
//! event bus.

use std::sync::Arc;

use pedia_core::PeerId;

use crate::chunk_store::ChunkStore;
use crate::distribution::{DistributionEngine, EngineSettings};
use crate::events::EventBus;
use crate::link::{LinkError, LinkSettings, PeerLinkManager};
use crate::manifest_store::ManifestStore;
use crate::router::MessageRouter;
use crate::signaling::SignalingClient;
use crate::topics::MemoryTopics;
use crate::transport::Connector;

/// Capabilities advertised to the relay on registration.
pub const CAPABILITIES: &[&str] = &["reliable", "unreliable", "bulk", "chunks"];

#[derive(Clone)]
pub struct Node {
    pub id: PeerId,
    pub links: PeerLinkManager,
    pub router: MessageRouter,
    pub engine: DistributionEngine,
    pub topics: MemoryTopics,
    pub events: EventBus,
}

impl Node {
    /// Register with signaling and start every component. Must be called
    /// inside a tokio runtime.
    pub fn start(
        id: PeerId,
        link_settings: LinkSettings,
        engine_settings: EngineSettings,
        connector: Arc<dyn Connector>,
        signaling: Arc<dyn SignalingClient>,
        store: ChunkStore,
        manifests: Arc<dyn ManifestStore>,
    ) -> Result<Self, LinkError> {
        let events = EventBus::default();
        let topics = MemoryTopics::new();
        let capabilities: Vec<String> = CAPABILITIES.iter().map(|c| c.to_string()).collect();

        let (links, inbound) = PeerLinkManager::start(
            id.clone(),
            link_settings,
            connector,
            signaling,
            events.clone(),
            &capabilities,
        )?;
        let router = MessageRouter::start(links.clone(), inbound);
        let engine = DistributionEngine::new(
            engine_settings,
            router.clone(),
            store,
            manifests,
            Arc::new(topics.clone()),
            events.clone(),
        );

        tracing::info!(peer = %id, "node started");
        Ok(Self {
            id,
            links,
            router,
            engine,
            topics,
            events,
        })
    }

    pub fn shutdown(&self) {
        self.links.shutdown();
        tracing::info!(peer = %self.id, "node stopped");
    }
}
