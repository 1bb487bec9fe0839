//! TCP relay server.
//!
//! Each client connection registers one peer id, then sends `relay` frames
//! that the server forwards as `deliver` frames to the target's
//! connection. Relays to unknown peers are answered with `unreachable`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use pedia_core::PeerId;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use super::RelayFrame;

struct Client {
    conn: u64,
    tx: mpsc::UnboundedSender<RelayFrame>,
}

type ClientTable = Arc<DashMap<PeerId, Client>>;

pub struct RelayServer {
    listener: TcpListener,
    clients: ClientTable,
    shutdown: broadcast::Receiver<()>,
}

impl RelayServer {
    pub async fn bind(addr: &str, shutdown: broadcast::Receiver<()>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind relay on {addr}"))?;
        Ok(Self {
            listener,
            clients: Arc::new(DashMap::new()),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(mut self) -> Result<()> {
        let next_conn = AtomicU64::new(0);
        tracing::info!(addr = %self.local_addr()?, "relay listening");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("relay shutting down");
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let conn = next_conn.fetch_add(1, Ordering::Relaxed);
                    let clients = self.clients.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_client(stream, conn, clients).await {
                            tracing::debug!(%addr, error = %e, "relay client ended");
                        }
                    });
                }
            }
        }
    }
}

async fn serve_client(stream: TcpStream, conn: u64, clients: ClientTable) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let (tx, mut rx) = mpsc::unbounded_channel::<RelayFrame>();
    let write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Ok(line) = frame.to_line() else { continue };
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut registered: Option<PeerId> = None;
    let result = async {
        while let Some(line) = lines.next_line().await? {
            let frame: RelayFrame = match serde_json::from_str(&line) {
                Ok(f) => f,
                Err(e) => {
                    tracing::debug!(conn, error = %e, "bad relay frame");
                    continue;
                }
            };
            match frame {
                RelayFrame::Register {
                    peer_id,
                    capabilities,
                } => {
                    tracing::info!(conn, peer = %peer_id, ?capabilities, "peer registered");
                    clients.insert(
                        peer_id.clone(),
                        Client {
                            conn,
                            tx: tx.clone(),
                        },
                    );
                    let _ = tx.send(RelayFrame::Registered {
                        peer_id: peer_id.clone(),
                    });
                    registered = Some(peer_id);
                }
                RelayFrame::Relay { target, signal } => {
                    let Some(from) = registered.clone() else {
                        tracing::debug!(conn, "relay before register");
                        continue;
                    };
                    let delivered = clients
                        .get(&target)
                        .map(|c| c.tx.send(RelayFrame::Deliver { from, signal }).is_ok())
                        .unwrap_or(false);
                    if !delivered {
                        tracing::debug!(conn, target = %target, "relay target unknown");
                        let _ = tx.send(RelayFrame::Unreachable { target });
                    }
                }
                other => {
                    tracing::debug!(conn, frame = ?other, "unexpected frame from client");
                }
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    if let Some(peer) = registered {
        clients.remove_if(&peer, |_, c| c.conn == conn);
        tracing::info!(conn, peer = %peer, "peer left relay");
    }
    write_task.abort();
    result
}
