//! pediad: pedia content-distribution daemon.
//!
//! `pediad relay [addr]` runs the signaling relay. `pediad [node]` runs a
//! peer: it registers with the configured relay, serves its chunk store to
//! other peers and exposes the local HTTP API.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use pedia_core::config::PediaConfig;
use pedia_core::PeerId;
use pedia_services::{
    ChunkStore, EngineSettings, JsonManifestStore, LinkSettings, Node, RelayServer, TcpConnector,
    TcpSignaling,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = PediaConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = PediaConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        PediaConfig::default()
    });

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("relay") => {
            let addr = args
                .next()
                .unwrap_or_else(|| config.signaling.listen_addr.clone());
            run_relay(&addr, shutdown_tx).await
        }
        None | Some("node") => run_node(config, shutdown_tx).await,
        Some(other) => anyhow::bail!("unknown mode {other:?}, expected `relay` or `node`"),
    }
}

// ── Relay ─────────────────────────────────────────────────────────────────────

async fn run_relay(addr: &str, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    tracing::info!(addr, "pediad relay starting");
    RelayServer::bind(addr, shutdown_tx.subscribe())
        .await?
        .run()
        .await
}

// ── Node ──────────────────────────────────────────────────────────────────────

async fn run_node(config: PediaConfig, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    let id = if config.identity.peer_id.trim().is_empty() {
        PeerId::random()
    } else {
        PeerId::new(config.identity.peer_id.trim())
    };
    tracing::info!(peer = %id, relay = %config.signaling.relay_addr, "pediad starting");

    // Storage
    let store = ChunkStore::new(&config.storage.chunk_dir)?;
    tracing::info!(root = %config.storage.chunk_dir.display(), chunks = store.count(), "chunk store ready");
    let manifests = Arc::new(JsonManifestStore::new(&config.storage.manifest_dir)?);
    std::fs::create_dir_all(&config.storage.download_dir).with_context(|| {
        format!(
            "failed to create download dir {}",
            config.storage.download_dir.display()
        )
    })?;

    // Signaling and transport
    let signaling = TcpSignaling::connect(&config.signaling.relay_addr)
        .await
        .context("failed to reach signaling relay")?;
    let transport_ip: IpAddr = config
        .link
        .transport_ip
        .parse()
        .with_context(|| format!("invalid transport ip {:?}", config.link.transport_ip))?;
    let connector = Arc::new(TcpConnector::new(transport_ip));

    let node = Node::start(
        id,
        LinkSettings::from(&config.link),
        EngineSettings::from_config(&config.distribution, &config.storage),
        connector,
        Arc::new(signaling),
        store,
        manifests,
    )?;

    // HTTP API
    let api_port = config.api.port;
    if api_port != 0 {
        let state = pedia_api::ApiState {
            node: node.clone(),
            started: Instant::now(),
            shutdown_tx: shutdown_tx.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = pedia_api::serve(state, api_port).await {
                tracing::error!(error = %e, "API server failed");
            }
        });
    } else {
        tracing::info!("API disabled");
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();
    let _ = shutdown_rx.recv().await;
    tracing::info!("shutting down");
    node.shutdown();
    Ok(())
}
