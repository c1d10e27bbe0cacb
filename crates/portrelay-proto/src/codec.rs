//! Length-prefixed wire framing
//!
//! Every message on a framed connection is `[u32 length][payload]`, where
//! the length covers the payload only and is encoded big-endian. Both ends
//! of a framed connection use this one byte order; nothing on the wire is
//! host-order.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Frame header size: payload length (4 bytes)
pub const FRAME_HEADER_LEN: usize = 4;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed frame codec.
///
/// Decoding yields one payload per complete frame and leaves trailing
/// partial bytes in the buffer for the next read; producing no frame from a
/// partial buffer is not an error. No maximum frame length is enforced: the
/// advertised length is trusted, so a framed connection must only be run
/// against a trusted peer.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encode a payload into a standalone frame.
    pub fn frame(payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        buf.freeze()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = &src[..FRAME_HEADER_LEN];
        let length = header.get_u32() as usize;

        if src.len() - FRAME_HEADER_LEN < length {
            // Wait for the rest of the payload; the header stays unconsumed.
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.reserve(FRAME_HEADER_LEN + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put(payload);
        Ok(())
    }
}
