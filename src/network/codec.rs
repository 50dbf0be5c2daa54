//! Length-prefixed frame codec
//!
//! Every frame on the wire is a 4-byte signed little-endian length `N`
//! followed by `N` payload bytes. `N` must lie in `0..=max_frame_bytes`.

use crate::network::error::{FrameError, MeshError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the length prefix
pub const LENGTH_PREFIX: usize = 4;

/// Default frame bound
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    AwaitingLength,
    AwaitingPayload(usize),
}

/// Per-connection frame codec
///
/// Decoding never waits: it returns `Ok(None)` until the bytes for the
/// next step are buffered, and remembers a consumed length prefix
/// across calls.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_bytes: usize,
    state: DecodeState,
}

impl FrameCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            state: DecodeState::AwaitingLength,
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    /// Whether a length prefix has been consumed and its payload is pending
    pub fn is_awaiting_payload(&self) -> bool {
        matches!(self.state, DecodeState::AwaitingPayload(_))
    }

    /// Reject payloads the peer would refuse
    pub fn check_len(&self, len: usize) -> Result<(), FrameError> {
        if len > self.max_frame_bytes {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = MeshError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.state == DecodeState::AwaitingLength {
            if src.len() < LENGTH_PREFIX {
                return Ok(None);
            }

            let declared = src.get_i32_le();
            if declared < 0 {
                return Err(FrameError::NegativeLength(declared).into());
            }
            let len = declared as usize;
            self.check_len(len)?;

            src.reserve(len);
            self.state = DecodeState::AwaitingPayload(len);
        }

        match self.state {
            DecodeState::AwaitingPayload(len) if src.len() >= len => {
                self.state = DecodeState::AwaitingLength;
                Ok(Some(src.split_to(len).freeze()))
            }
            _ => Ok(None),
        }
    }
}

impl<'a> Encoder<&'a [u8]> for FrameCodec {
    type Error = MeshError;

    fn encode(&mut self, item: &'a [u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.check_len(item.len())?;

        dst.reserve(LENGTH_PREFIX + item.len());
        dst.put_i32_le(item.len() as i32);
        dst.put_slice(item);

        Ok(())
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = MeshError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        <Self as Encoder<&[u8]>>::encode(self, item.as_ref(), dst)
    }
}
