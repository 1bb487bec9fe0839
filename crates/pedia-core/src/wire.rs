//! pedia wire format: everything that crosses a PeerLink.
//!
//! A PeerLink is one ordered byte stream. Three logical channels are
//! multiplexed over it by prefixing every payload with a fixed 8-byte
//! [`FrameHeader`]. Reliable and unreliable payloads carry a JSON
//! [`Envelope`]; bulk payloads carry binary `chunk-data` frames.
//!
//! Headers use zerocopy derives for allocation-free encoding. Multi-byte
//! integers are stored as little-endian byte arrays so the layout does not
//! depend on the host.

use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::crypto::{ChunkId, FileId};
use crate::ids::PeerId;
use crate::manifest::Manifest;

// ── Frame Header ─────────────────────────────────────────────────────────────

/// Prefix of every frame on a PeerLink stream.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Logical channel, see [`Channel`].
    pub channel: u8,
    /// Frame kind, see [`FrameKind`].
    pub kind: u8,
    /// Must be zero.
    pub reserved: [u8; 2],
    /// Payload length in bytes, little-endian.
    pub length: [u8; 4],
}

assert_eq_size!(FrameHeader, [u8; 8]);

pub const FRAME_HEADER_LEN: usize = 8;

/// Largest payload a single frame may carry.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// Logical channel multiplexed over a PeerLink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Channel {
    /// Ordered, never dropped. Application messages.
    Reliable = 0x01,
    /// Dropped under back-pressure. Presence-style traffic.
    Unreliable = 0x02,
    /// Chunk payloads.
    Bulk = 0x03,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Reliable, Channel::Unreliable, Channel::Bulk];

    pub fn name(self) -> &'static str {
        match self {
            Channel::Reliable => "reliable",
            Channel::Unreliable => "unreliable",
            Channel::Bulk => "bulk",
        }
    }
}

impl TryFrom<u8> for Channel {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Channel::Reliable),
            0x02 => Ok(Channel::Unreliable),
            0x03 => Ok(Channel::Bulk),
            other => Err(WireError::UnknownChannel(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Sender has opened the channel; payload is empty.
    Open = 0x01,
    Data = 0x02,
    /// Sender is tearing the link down; payload is empty.
    Close = 0x03,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Open),
            0x02 => Ok(FrameKind::Data),
            0x03 => Ok(FrameKind::Close),
            other => Err(WireError::UnknownFrameKind(other)),
        }
    }
}

impl FrameHeader {
    pub fn new(channel: Channel, kind: FrameKind, length: usize) -> Result<Self, WireError> {
        if length > MAX_FRAME_PAYLOAD {
            return Err(WireError::PayloadTooLarge(length));
        }
        Ok(Self {
            channel: channel as u8,
            kind: kind as u8,
            reserved: [0; 2],
            length: (length as u32).to_le_bytes(),
        })
    }

    /// Decode and validate a header read off the stream.
    pub fn decode(bytes: &[u8; FRAME_HEADER_LEN]) -> Result<(Channel, FrameKind, usize), WireError> {
        let header = FrameHeader::read_from(&bytes[..]).ok_or(WireError::Truncated)?;
        if header.reserved != [0; 2] {
            return Err(WireError::ReservedSet);
        }
        let length = u32::from_le_bytes(header.length) as usize;
        if length > MAX_FRAME_PAYLOAD {
            return Err(WireError::PayloadTooLarge(length));
        }
        Ok((
            Channel::try_from(header.channel)?,
            FrameKind::try_from(header.kind)?,
            length,
        ))
    }
}

/// Encode a complete frame (header + payload).
pub fn encode_frame(channel: Channel, kind: FrameKind, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let header = FrameHeader::new(channel, kind, payload.len())?;
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

// ── Chunk data (bulk channel) ────────────────────────────────────────────────

/// Prefix of a `chunk-data` payload on the bulk channel.
///
/// Wire size: 36 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ChunkDataHeader {
    /// Claimed content hash. The receiver re-hashes before trusting it.
    pub chunk_id: [u8; 32],
    /// Chunk length, little-endian.
    pub length: [u8; 4],
}

assert_eq_size!(ChunkDataHeader, [u8; 36]);

pub const CHUNK_DATA_HEADER_LEN: usize = 36;

/// Largest chunk that still fits one bulk frame with its header.
pub const MAX_CHUNK_PAYLOAD: usize = MAX_FRAME_PAYLOAD - CHUNK_DATA_HEADER_LEN;

pub fn encode_chunk_data(id: &ChunkId, data: &[u8]) -> Vec<u8> {
    let header = ChunkDataHeader {
        chunk_id: id.0,
        length: (data.len() as u32).to_le_bytes(),
    };
    let mut out = Vec::with_capacity(CHUNK_DATA_HEADER_LEN + data.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(data);
    out
}

/// Split a bulk payload into the claimed chunk id and its bytes.
pub fn decode_chunk_data(payload: &[u8]) -> Result<(ChunkId, &[u8]), WireError> {
    let header = ChunkDataHeader::read_from_prefix(payload).ok_or(WireError::Truncated)?;
    let length = u32::from_le_bytes(header.length) as usize;
    let body = &payload[CHUNK_DATA_HEADER_LEN..];
    if body.len() != length {
        return Err(WireError::LengthMismatch {
            declared: length,
            actual: body.len(),
        });
    }
    Ok((ChunkId(header.chunk_id), body))
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// JSON envelope: the payload of every reliable/unreliable data frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub data: serde_json::Value,
    /// Unix milliseconds at the sender.
    pub timestamp: u64,
    pub from: PeerId,
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        serde_json::to_vec(self).map_err(|e| WireError::Json(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(data).map_err(|e| WireError::Json(e.to_string()))
    }

    /// Deserialize `data` into a typed payload.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, WireError> {
        serde_json::from_value(self.data.clone()).map_err(|e| WireError::Json(e.to_string()))
    }
}

/// Well-known `type` strings.
pub mod msg_types {
    pub const FILE_AVAILABLE: &str = "file-available";
    pub const CHUNK_REQUEST: &str = "chunk-request";
    pub const CHUNK_DATA: &str = "chunk-data";
    pub const CHUNK_UNAVAILABLE: &str = "chunk-unavailable";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAvailable {
    pub manifest: Manifest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRequest {
    pub file_id: FileId,
    pub chunk_id: ChunkId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUnavailable {
    pub file_id: FileId,
    pub chunk_id: ChunkId,
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown channel byte: 0x{0:02x}")]
    UnknownChannel(u8),

    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownFrameKind(u8),

    #[error("payload length {0} exceeds maximum {}", MAX_FRAME_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("reserved header bytes are non-zero")]
    ReservedSet,

    #[error("frame truncated")]
    Truncated,

    #[error("chunk-data declares {declared} bytes, carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("invalid envelope: {0}")]
    Json(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash;

    #[test]
    fn frame_header_layout() {
        let frame = encode_frame(Channel::Bulk, FrameKind::Data, b"hello").unwrap();
        assert_eq!(frame.len(), FRAME_HEADER_LEN + 5);
        assert_eq!(frame[0], 0x03);
        assert_eq!(frame[1], 0x02);
        assert_eq!(&frame[4..8], &5u32.to_le_bytes());

        let header: [u8; 8] = frame[..8].try_into().unwrap();
        let (channel, kind, len) = FrameHeader::decode(&header).unwrap();
        assert_eq!(channel, Channel::Bulk);
        assert_eq!(kind, FrameKind::Data);
        assert_eq!(len, 5);
    }

    #[test]
    fn decode_rejects_bad_headers() {
        assert_eq!(
            FrameHeader::decode(&[0x09, 0x02, 0, 0, 0, 0, 0, 0]),
            Err(WireError::UnknownChannel(0x09))
        );
        assert_eq!(
            FrameHeader::decode(&[0x01, 0x07, 0, 0, 0, 0, 0, 0]),
            Err(WireError::UnknownFrameKind(0x07))
        );
        assert_eq!(
            FrameHeader::decode(&[0x01, 0x02, 1, 0, 0, 0, 0, 0]),
            Err(WireError::ReservedSet)
        );
        let huge = ((MAX_FRAME_PAYLOAD + 1) as u32).to_le_bytes();
        let header = [0x01, 0x02, 0, 0, huge[0], huge[1], huge[2], huge[3]];
        assert!(matches!(
            FrameHeader::decode(&header),
            Err(WireError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn oversized_payload_is_refused_at_encode() {
        let payload = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        assert!(encode_frame(Channel::Bulk, FrameKind::Data, &payload).is_err());
    }

    #[test]
    fn chunk_data_carries_claimed_id() {
        let data = b"ten bytes!";
        let id = hash(data);
        let encoded = encode_chunk_data(&id, data);
        assert_eq!(encoded.len(), CHUNK_DATA_HEADER_LEN + data.len());
        let largest = encode_chunk_data(&id, &vec![0u8; MAX_CHUNK_PAYLOAD]);
        assert!(encode_frame(Channel::Bulk, FrameKind::Data, &largest).is_ok());

        let (decoded_id, body) = decode_chunk_data(&encoded).unwrap();
        assert_eq!(decoded_id, id);
        assert_eq!(body, data);
    }

    #[test]
    fn chunk_data_length_mismatch() {
        let id = hash(b"x");
        let mut encoded = encode_chunk_data(&id, b"abc");
        encoded.pop();
        assert_eq!(
            decode_chunk_data(&encoded),
            Err(WireError::LengthMismatch {
                declared: 3,
                actual: 2
            })
        );
        assert_eq!(decode_chunk_data(&encoded[..10]), Err(WireError::Truncated));
    }

    #[test]
    fn envelope_uses_type_key() {
        let env = Envelope {
            msg_type: msg_types::CHUNK_REQUEST.into(),
            data: serde_json::to_value(ChunkRequest {
                file_id: FileId::from("f1"),
                chunk_id: hash(b"c"),
            })
            .unwrap(),
            timestamp: 42,
            from: PeerId::from("alice"),
        };
        let json: serde_json::Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "chunk-request");
        assert_eq!(json["data"]["fileId"], "f1");

        let back = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        let req: ChunkRequest = back.payload().unwrap();
        assert_eq!(req.chunk_id, hash(b"c"));
    }
}
