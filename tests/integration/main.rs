//! pedia integration test harness.
//!
//! Every test runs whole nodes inside the test process: links, router and
//! distribution engine, wired either through the in-process relay and
//! memory transport or through a real TCP relay on loopback.
//!
//!   cargo test --test integration

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use pedia_core::{PeerId, TopicId};
use pedia_services::{
    ChunkStore, Connector, EngineSettings, Event, LinkSettings, LocalRelay, MemoryConnector,
    MemoryManifestStore, Node, SignalingClient,
};

mod messaging;
mod tcp;
mod transfers;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Topic every test node joins.
pub const ROOM: &str = "room";

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Fresh directory under the system temp dir, unique per process and call.
pub fn temp_dir(tag: &str) -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("pedia-it-{tag}-{}-{}", std::process::id(), id));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

pub fn engine_settings() -> EngineSettings {
    EngineSettings {
        chunk_size: 64 * 1024,
        adaptive_chunking: false,
        chunk_timeout: Duration::from_secs(3),
        download_dir: temp_dir("downloads"),
        ..EngineSettings::default()
    }
}

pub fn start_node(
    id: &str,
    connector: Arc<dyn Connector>,
    signaling: Arc<dyn SignalingClient>,
) -> Result<Node> {
    let store = ChunkStore::new(temp_dir("chunks"))?;
    let node = Node::start(
        PeerId::from(id),
        LinkSettings::default(),
        engine_settings(),
        connector,
        signaling,
        store,
        Arc::new(MemoryManifestStore::new()),
    )?;
    Ok(node)
}

/// Nodes sharing one in-process relay and memory transport.
pub struct Mesh {
    pub relay: LocalRelay,
    pub hub: MemoryConnector,
}

impl Mesh {
    pub fn new() -> Self {
        Self {
            relay: LocalRelay::new(),
            hub: MemoryConnector::new(),
        }
    }

    pub fn node(&self, id: &str) -> Result<Node> {
        start_node(id, Arc::new(self.hub.clone()), Arc::new(self.relay.client()))
    }
}

/// Put every node in every node's view of [`ROOM`].
pub fn join_room(nodes: &[&Node]) {
    let room = TopicId::from(ROOM);
    for view in nodes {
        for member in nodes {
            view.topics.add_member(&room, member.id.clone());
        }
    }
}

/// Poll `cond` until it holds or `secs` elapse.
pub async fn wait_for(secs: u64, mut cond: impl FnMut() -> bool) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(secs), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("condition not reached in time")
}

/// Open a link from `a` to `b` and wait until both ends see it.
pub async fn link(a: &Node, b: &Node) -> Result<()> {
    let mut events = a.events.subscribe();
    a.links.connect(&b.id)?;
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(Event::PeerConnected { peer_id }) if peer_id == b.id => return Ok(()),
                Ok(_) => {}
                Err(e) => bail!("event stream ended: {e}"),
            }
        }
    })
    .await
    .context("link did not open")??;
    wait_for(10, || b.links.is_connected(&a.id)).await
}

/// Deterministic, non-repeating test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len as u32).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect()
}
