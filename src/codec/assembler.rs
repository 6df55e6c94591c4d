//! Frame reassembly for stream sockets.
//!
//! A stream delivers bytes, not packets. The assembler buffers whatever has
//! arrived and cuts complete frames off the front using the header's length
//! field. A header that fails validation poisons the stream: there is no way
//! to find the next frame boundary, so the caller must close the connection.

use bytes::{Bytes, BytesMut};

use super::packet::PacketCodec;
use crate::core::error::DecodeError;

/// Accumulates stream bytes and yields whole frames.
#[derive(Debug)]
pub struct FrameAssembler {
    codec: PacketCodec,
    buffer: BytesMut,
    poisoned: bool,
}

impl FrameAssembler {
    /// Create an empty assembler.
    pub fn new(codec: PacketCodec) -> Self {
        Self {
            codec,
            buffer: BytesMut::new(),
            poisoned: false,
        }
    }

    /// Append received bytes.
    pub fn push(&mut self, data: &[u8]) {
        if !self.poisoned {
            self.buffer.extend_from_slice(data);
        }
    }

    /// Take the next complete frame, if one is buffered.
    ///
    /// Once an error is returned every later call returns `None`.
    pub fn next_frame(&mut self) -> Option<Result<Bytes, DecodeError>> {
        if self.poisoned {
            return None;
        }
        match self.codec.peek_frame_len(&self.buffer) {
            Ok(Some(len)) => Some(Ok(self.buffer.split_to(len).freeze())),
            Ok(None) => None,
            Err(err) => {
                self.poisoned = true;
                self.buffer.clear();
                Some(Err(err))
            }
        }
    }

    /// Bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether a framing error has been seen.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}
