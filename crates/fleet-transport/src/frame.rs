//! Frame codec and message chunking.
//!
//! Wire layout of one frame:
//!
//! ```text
//! +-------+----------------+-----------------+
//! | flags | length (u32 BE)| payload         |
//! +-------+----------------+-----------------+
//! ```
//!
//! `flags` bit 0 marks the final frame of a message, bit 1 marks a close frame.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fleet_protocol::{MAX_FRAME_SIZE, MAX_MESSAGE_SIZE};
use tokio_util::codec::{Decoder, Encoder};

use crate::TransportError;

const FLAG_FIN: u8 = 0b0000_0001;
const FLAG_CLOSE: u8 = 0b0000_0010;
const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Last frame of the current message.
    pub fin: bool,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(payload: Bytes, fin: bool) -> Self {
        Self {
            kind: FrameKind::Data,
            fin,
            payload,
        }
    }

    pub fn close() -> Self {
        Self {
            kind: FrameKind::Close,
            fin: true,
            payload: Bytes::new(),
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.fin {
            flags |= FLAG_FIN;
        }
        if self.kind == FrameKind::Close {
            flags |= FLAG_CLOSE;
        }
        flags
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let flags = src[0];
        if flags & !(FLAG_FIN | FLAG_CLOSE) != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame flags {flags:#04x}"),
            ));
        }

        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > self.max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame too large: {len} bytes (max {})", self.max_frame_size),
            ));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        let kind = if flags & FLAG_CLOSE != 0 {
            FrameKind::Close
        } else {
            FrameKind::Data
        };

        Ok(Some(Frame {
            kind,
            fin: flags & FLAG_FIN != 0,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > self.max_frame_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "frame too large: {} bytes (max {})",
                    item.payload.len(),
                    self.max_frame_size
                ),
            ));
        }

        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_u8(item.flags());
        dst.put_u32(item.payload.len() as u32);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

/// Split one message into data frames of at most `chunk_size` bytes.
///
/// Exactly the last frame carries FIN. An empty message becomes a single
/// empty FIN frame.
pub fn split_message(message: Bytes, chunk_size: usize) -> Vec<Frame> {
    let chunk_size = chunk_size.max(1);
    if message.is_empty() {
        return vec![Frame::data(message, true)];
    }

    let count = message.len().div_ceil(chunk_size);
    (0..count)
        .map(|i| {
            let start = i * chunk_size;
            let end = (start + chunk_size).min(message.len());
            Frame::data(message.slice(start..end), i + 1 == count)
        })
        .collect()
}

/// Accumulates data frames until a FIN frame completes the message.
#[derive(Debug)]
pub struct MessageAssembler {
    buffer: BytesMut,
    max_message_size: usize,
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl MessageAssembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_message_size,
        }
    }

    /// Add a frame. Returns the complete message once the FIN frame arrives.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Bytes>, TransportError> {
        let size = self.buffer.len() + frame.payload.len();
        if size > self.max_message_size {
            self.buffer.clear();
            return Err(TransportError::MessageTooLarge {
                size,
                limit: self.max_message_size,
            });
        }

        self.buffer.extend_from_slice(&frame.payload);
        if frame.fin {
            Ok(Some(self.buffer.split().freeze()))
        } else {
            Ok(None)
        }
    }

    /// Bytes buffered for a message whose FIN frame has not arrived yet.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
