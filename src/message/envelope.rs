//! Wire framing for gossip messages.
//!
//! ```text
//! ┌──────────────────┬────────────────────┬─────────────────┐
//! │ magic "mgossip"  │ message id (u64 BE)│ payload         │
//! │ (7 bytes)        │ (8 bytes)          │ (rest)          │
//! └──────────────────┴────────────────────┴─────────────────┘
//! ```
//!
//! The magic tag separates gossip traffic from anything else the
//! transport multiplexes over the same user-message channel.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use super::MessageId;

/// Magic tag prefixed to every gossip message.
pub const MAGIC: &[u8] = b"mgossip";

/// Fixed header size: magic + message id.
pub const HEADER_SIZE: usize = MAGIC.len() + MessageId::ENCODED_SIZE;

/// Reasons a buffer could not be decoded as a gossip envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer is shorter than the fixed header.
    Truncated {
        /// Length of the buffer that was received.
        len: usize,
    },
    /// Magic tag does not match; the buffer belongs to some other protocol.
    NotGossip,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { len } => {
                write!(
                    f,
                    "envelope truncated: {} bytes, need at least {}",
                    len, HEADER_SIZE
                )
            }
            DecodeError::NotGossip => write!(f, "magic tag mismatch"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// A decoded gossip message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Identifier assigned by the originating node.
    pub id: MessageId,
    /// Opaque application payload.
    pub payload: Bytes,
}

impl Envelope {
    /// Create a new envelope.
    pub fn new(id: MessageId, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    /// Size of this envelope on the wire.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Bytes {
        encode(self.id, &self.payload)
    }
}

/// Frame `payload` with the magic tag and `id`.
pub fn encode(id: MessageId, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    encode_into(id, payload, &mut buf);
    buf.freeze()
}

/// Frame `payload` into an existing buffer.
pub fn encode_into(id: MessageId, payload: &[u8], buf: &mut impl BufMut) {
    buf.put_slice(MAGIC);
    buf.put_u64(id.as_u64());
    buf.put_slice(payload);
}

/// Returns `true` if `data` starts with the gossip magic tag.
#[inline]
pub fn is_gossip_message(data: &[u8]) -> bool {
    data.starts_with(MAGIC)
}

/// Decode a framed message.
///
/// The payload shares the input buffer; no bytes are copied.
pub fn decode(data: &Bytes) -> Result<Envelope, DecodeError> {
    if data.len() < HEADER_SIZE {
        return Err(DecodeError::Truncated { len: data.len() });
    }
    if !is_gossip_message(data) {
        return Err(DecodeError::NotGossip);
    }

    let id = MessageId::decode_from_slice(&data[MAGIC.len()..])
        .ok_or(DecodeError::Truncated { len: data.len() })?;

    Ok(Envelope {
        id,
        payload: data.slice(HEADER_SIZE..),
    })
}

/// Decode a framed message from a borrowed slice, copying the payload.
pub fn decode_from_slice(data: &[u8]) -> Result<Envelope, DecodeError> {
    decode(&Bytes::copy_from_slice(data))
}
