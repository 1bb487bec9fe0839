//! Direct peer transports.
//!
//! A [`Connector`] turns an exchange of opaque offer/answer payloads
//! (carried by signaling) into one bidirectional byte stream per peer.
//! Channels are multiplexed over that stream with the frame codec from
//! `pedia_core::wire`.

use futures::future::BoxFuture;
use pedia_core::wire::{encode_frame, Channel, FrameHeader, FrameKind, FRAME_HEADER_LEN};
use pedia_core::PeerId;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

mod memory;
mod tcp;

pub use memory::MemoryConnector;
pub use tcp::TcpConnector;

pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> LinkStream for T {}

pub type BoxStream = Box<dyn LinkStream>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("malformed negotiation payload: {0}")]
    BadPayload(String),
    #[error("offer is unknown or already answered")]
    UnknownOffer,
    #[error("offer was withdrawn")]
    Withdrawn,
    #[error("transport io: {0}")]
    Io(#[from] std::io::Error),
}

/// Initiator half of a negotiation, waiting for the remote answer.
pub trait PendingOffer: Send {
    fn complete(self: Box<Self>, answer: Vec<u8>) -> BoxFuture<'static, Result<BoxStream, TransportError>>;
}

pub trait Connector: Send + Sync + 'static {
    /// Produce an offer payload for `peer`.
    fn offer(
        &self,
        peer: &PeerId,
    ) -> BoxFuture<'static, Result<(Vec<u8>, Box<dyn PendingOffer>), TransportError>>;

    /// Accept a remote offer, returning the answer payload and the stream.
    fn answer(
        &self,
        peer: &PeerId,
        offer: Vec<u8>,
    ) -> BoxFuture<'static, Result<(Vec<u8>, BoxStream), TransportError>>;
}

// ── Framing ───────────────────────────────────────────────────────────────────

pub(crate) type Frame = (Channel, FrameKind, Vec<u8>);

/// Read one frame. `Ok(None)` on a clean end of stream between frames.
pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Frame>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let (channel, kind, len) = FrameHeader::decode(&header)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some((channel, kind, payload)))
}

pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    channel: Channel,
    kind: FrameKind,
    payload: &[u8],
) -> std::io::Result<()> {
    let frame = encode_frame(channel, kind, payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}
