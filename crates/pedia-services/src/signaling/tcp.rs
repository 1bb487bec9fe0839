//! Client side of the TCP relay protocol.

use std::sync::{Arc, Mutex};

use pedia_core::PeerId;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::{RelayFrame, Signal, SignalEvent, SignalReceiver, SignalingClient, SignalingError};

type EventSink = Arc<Mutex<Option<mpsc::UnboundedSender<SignalEvent>>>>;

#[derive(Clone)]
pub struct TcpSignaling {
    out: mpsc::UnboundedSender<RelayFrame>,
    sink: EventSink,
    registered: Arc<Mutex<Option<PeerId>>>,
}

impl TcpSignaling {
    /// Connect to a relay. Reader and writer tasks live until the relay
    /// closes the connection or every handle is dropped.
    pub async fn connect(addr: &str) -> Result<Self, SignalingError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SignalingError::Io(format!("connect {addr}: {e}")))?;
        let (reader, mut writer) = stream.into_split();

        let (out, mut out_rx) = mpsc::unbounded_channel::<RelayFrame>();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let Ok(line) = frame.to_line() else { continue };
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    tracing::warn!(error = %e, "relay write failed");
                    break;
                }
            }
        });

        let sink: EventSink = Arc::new(Mutex::new(None));
        let reader_sink = sink.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(l)) => l,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "relay read failed");
                        break;
                    }
                };
                let event = match serde_json::from_str::<RelayFrame>(&line) {
                    Ok(RelayFrame::Deliver { from, signal }) => SignalEvent::Received { from, signal },
                    Ok(RelayFrame::Unreachable { target }) => SignalEvent::Unreachable { target },
                    Ok(RelayFrame::Registered { peer_id }) => {
                        tracing::debug!(peer = %peer_id, "relay confirmed registration");
                        continue;
                    }
                    Ok(other) => {
                        tracing::debug!(frame = ?other, "unexpected frame from relay");
                        continue;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "bad frame from relay");
                        continue;
                    }
                };
                let tx = reader_sink.lock().unwrap_or_else(|e| e.into_inner()).clone();
                match tx {
                    Some(tx) => {
                        let _ = tx.send(event);
                    }
                    None => tracing::debug!("signal before registration dropped"),
                }
            }
            tracing::info!("relay connection closed");
            // Dropping the sender ends the registered receiver.
            reader_sink.lock().unwrap_or_else(|e| e.into_inner()).take();
        });

        tracing::info!(relay = addr, "connected to relay");
        Ok(Self {
            out,
            sink,
            registered: Arc::new(Mutex::new(None)),
        })
    }
}

impl SignalingClient for TcpSignaling {
    fn register(
        &self,
        peer: &PeerId,
        capabilities: &[String],
    ) -> Result<SignalReceiver, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        self.out
            .send(RelayFrame::Register {
                peer_id: peer.clone(),
                capabilities: capabilities.to_vec(),
            })
            .map_err(|_| SignalingError::Closed)?;
        *self.registered.lock().unwrap_or_else(|e| e.into_inner()) = Some(peer.clone());
        Ok(rx)
    }

    fn relay(&self, target: &PeerId, signal: Signal) -> Result<(), SignalingError> {
        if self
            .registered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
        {
            return Err(SignalingError::NotRegistered);
        }
        self.out
            .send(RelayFrame::Relay {
                target: target.clone(),
                signal,
            })
            .map_err(|_| SignalingError::Closed)
    }
}
