//! Bitcoin P2P framing for `tokio_util::codec::Framed`.
//!
//! Each frame is the 24-byte message header (magic, command, length,
//! checksum) followed by the payload. A wrong magic or an oversized length is
//! a protocol violation and ends the connection.

use bitcoin::consensus::encode::{deserialize_partial, serialize};
use bitcoin::p2p::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::p2p::Magic;
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const HEADER_LEN: usize = 24;
/// Largest payload accepted from a peer.
pub const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    magic: Magic,
}

impl MessageCodec {
    pub fn new(magic: Magic) -> Self { Self { magic } }
}

impl Decoder for MessageCodec {
    type Item = NetworkMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<NetworkMessage>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        if src[0..4] != self.magic.to_bytes() {
            return Err(CodecError::Protocol(format!("bad magic {}", hex::encode(&src[0..4]))));
        }
        let len = u32::from_le_bytes([src[16], src[17], src[18], src[19]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(CodecError::Protocol(format!("payload of {len} bytes exceeds limit")));
        }
        let frame_len = HEADER_LEN + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }
        let (raw, _): (RawNetworkMessage, usize) =
            deserialize_partial(&src[..frame_len]).map_err(|e| CodecError::Protocol(format!("decode: {e}")))?;
        src.advance(frame_len);
        Ok(Some(raw.payload().clone()))
    }
}

impl Encoder<NetworkMessage> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: NetworkMessage, dst: &mut BytesMut) -> Result<(), CodecError> {
        let raw = RawNetworkMessage::new(self.magic, item);
        dst.extend_from_slice(&serialize(&raw));
        Ok(())
    }
}
