//! In-process transport over `tokio::io::duplex` pipes.
//!
//! All nodes that should reach each other share one [`MemoryConnector`]
//! (clones share the hub). The offer payload is a token naming a parked
//! oneshot; answering it hands one end of a fresh pipe to the initiator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use pedia_core::PeerId;
use tokio::io::DuplexStream;
use tokio::sync::oneshot;

use super::{BoxStream, Connector, PendingOffer, TransportError};

const PIPE_CAPACITY: usize = 256 * 1024;

#[derive(Clone, Default)]
pub struct MemoryConnector {
    parked: Arc<DashMap<u64, oneshot::Sender<DuplexStream>>>,
    next_token: Arc<AtomicU64>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers not yet answered.
    pub fn parked(&self) -> usize {
        self.parked.len()
    }
}

struct MemoryPending {
    rx: oneshot::Receiver<DuplexStream>,
}

impl PendingOffer for MemoryPending {
    fn complete(self: Box<Self>, _answer: Vec<u8>) -> BoxFuture<'static, Result<BoxStream, TransportError>> {
        Box::pin(async move {
            let stream = self.rx.await.map_err(|_| TransportError::Withdrawn)?;
            Ok(Box::new(stream) as BoxStream)
        })
    }
}

impl Connector for MemoryConnector {
    fn offer(
        &self,
        peer: &PeerId,
    ) -> BoxFuture<'static, Result<(Vec<u8>, Box<dyn PendingOffer>), TransportError>> {
        // Offers whose negotiation was abandoned.
        self.parked.retain(|_, tx| !tx.is_closed());

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.parked.insert(token, tx);
        tracing::trace!(peer = %peer, token, "memory offer parked");
        Box::pin(async move {
            Ok((
                token.to_le_bytes().to_vec(),
                Box::new(MemoryPending { rx }) as Box<dyn PendingOffer>,
            ))
        })
    }

    fn answer(
        &self,
        peer: &PeerId,
        offer: Vec<u8>,
    ) -> BoxFuture<'static, Result<(Vec<u8>, BoxStream), TransportError>> {
        let parked = self.parked.clone();
        let peer = peer.clone();
        Box::pin(async move {
            let token: [u8; 8] = offer
                .as_slice()
                .try_into()
                .map_err(|_| TransportError::BadPayload(format!("{} byte token", offer.len())))?;
            let token = u64::from_le_bytes(token);
            let (_, tx) = parked.remove(&token).ok_or(TransportError::UnknownOffer)?;

            let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
            tx.send(theirs).map_err(|_| TransportError::Withdrawn)?;
            tracing::trace!(peer = %peer, token, "memory offer answered");
            Ok((Vec::new(), Box::new(ours) as BoxStream))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn offer_answer_complete_yields_connected_pipe() {
        let hub = MemoryConnector::new();
        let (offer, pending) = hub.offer(&PeerId::from("b")).await.unwrap();
        assert_eq!(hub.parked(), 1);

        let (answer, mut responder) = hub.answer(&PeerId::from("a"), offer).await.unwrap();
        let mut initiator = pending.complete(answer).await.unwrap();
        assert_eq!(hub.parked(), 0);

        initiator.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        responder.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn offers_answer_only_once() {
        let hub = MemoryConnector::new();
        let (offer, _pending) = hub.offer(&PeerId::from("b")).await.unwrap();
        hub.answer(&PeerId::from("a"), offer.clone()).await.unwrap();
        assert!(matches!(
            hub.answer(&PeerId::from("a"), offer).await,
            Err(TransportError::UnknownOffer)
        ));
    }

    #[tokio::test]
    async fn garbage_offer_is_rejected() {
        let hub = MemoryConnector::new();
        assert!(matches!(
            hub.answer(&PeerId::from("a"), vec![1, 2]).await,
            Err(TransportError::BadPayload(_))
        ));
    }
}
