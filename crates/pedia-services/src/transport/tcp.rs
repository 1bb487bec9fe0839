//! TCP transport. The initiator binds an ephemeral listener and offers its
//! address plus a random token; the responder dials it and writes the
//! token first so the initiator can tell its peer from stray connections.

use std::net::{IpAddr, SocketAddr};

use futures::future::BoxFuture;
use pedia_core::PeerId;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::{BoxStream, Connector, PendingOffer, TransportError};

const TOKEN_LEN: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct TcpOffer {
    addr: SocketAddr,
    token: String,
}

#[derive(Clone)]
pub struct TcpConnector {
    bind_ip: IpAddr,
}

impl TcpConnector {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self { bind_ip }
    }
}

struct TcpPending {
    listener: TcpListener,
    token: [u8; TOKEN_LEN],
}

impl PendingOffer for TcpPending {
    fn complete(self: Box<Self>, _answer: Vec<u8>) -> BoxFuture<'static, Result<BoxStream, TransportError>> {
        Box::pin(async move {
            // The caller bounds this with the negotiation timeout.
            loop {
                let (mut stream, addr) = self.listener.accept().await?;
                let mut presented = [0u8; TOKEN_LEN];
                match stream.read_exact(&mut presented).await {
                    Ok(_) if presented == self.token => {
                        stream.set_nodelay(true)?;
                        return Ok(Box::new(stream) as BoxStream);
                    }
                    Ok(_) => tracing::warn!(%addr, "tcp transport: wrong token, dropping"),
                    Err(e) => tracing::debug!(%addr, error = %e, "tcp transport: no token"),
                }
            }
        })
    }
}

impl Connector for TcpConnector {
    fn offer(
        &self,
        peer: &PeerId,
    ) -> BoxFuture<'static, Result<(Vec<u8>, Box<dyn PendingOffer>), TransportError>> {
        let bind = SocketAddr::new(self.bind_ip, 0);
        let peer = peer.clone();
        Box::pin(async move {
            let listener = TcpListener::bind(bind).await?;
            let addr = listener.local_addr()?;
            let mut token = [0u8; TOKEN_LEN];
            rand::thread_rng().fill_bytes(&mut token);

            let offer = serde_json::to_vec(&TcpOffer {
                addr,
                token: hex::encode(token),
            })
            .map_err(|e| TransportError::BadPayload(e.to_string()))?;
            tracing::debug!(peer = %peer, %addr, "tcp offer ready");
            Ok((
                offer,
                Box::new(TcpPending { listener, token }) as Box<dyn PendingOffer>,
            ))
        })
    }

    fn answer(
        &self,
        peer: &PeerId,
        offer: Vec<u8>,
    ) -> BoxFuture<'static, Result<(Vec<u8>, BoxStream), TransportError>> {
        let peer = peer.clone();
        Box::pin(async move {
            let offer: TcpOffer = serde_json::from_slice(&offer)
                .map_err(|e| TransportError::BadPayload(e.to_string()))?;
            let token = hex::decode(&offer.token)
                .map_err(|e| TransportError::BadPayload(e.to_string()))?;
            if token.len() != TOKEN_LEN {
                return Err(TransportError::BadPayload(format!(
                    "{} byte token",
                    token.len()
                )));
            }

            let mut stream = TcpStream::connect(offer.addr).await?;
            stream.set_nodelay(true)?;
            stream.write_all(&token).await?;
            tracing::debug!(peer = %peer, addr = %offer.addr, "tcp offer answered");
            Ok((Vec::new(), Box::new(stream) as BoxStream))
        })
    }
}
