//! Line framing with a binary sub-mode
//!
//! Protocol traffic is newline terminated text. A `D <conn> <chan> <size>`
//! header switches the decoder into binary mode for exactly `size` bytes,
//! which are yielded as [`Frame::Data`] chunks before line mode resumes.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::PROTO_DATA;
use crate::params::Params;

/// Maximum accepted line length (1 MB)
const MAX_LINE_SIZE: usize = 1024 * 1024;

/// Codec error
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Line too long: {size} bytes (max {max})")]
    LineTooLong { size: usize, max: usize },

    #[error("Line is not valid UTF-8")]
    InvalidUtf8,
}

/// One unit of protocol traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A text line without its terminator
    Line(String),
    /// Raw bytes following a data header
    Data(Bytes),
}

impl Frame {
    pub fn line(text: impl Into<String>) -> Self {
        Self::Line(text.into())
    }
}

/// Codec used on both ends of a peer socket.
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Bytes of binary payload still expected
    binary_remaining: usize,
    /// Offset already scanned for a newline
    next_index: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of binary payload the decoder still waits for.
    pub fn binary_remaining(&self) -> usize {
        self.binary_remaining
    }

    fn data_header_size(line: &str) -> Option<usize> {
        let (tag, mut params) = Params::split_command(line);
        if tag != PROTO_DATA {
            return None;
        }
        params.next_i32().ok()?;
        params.next_i32().ok()?;
        let size = params.next_usize().ok()?;
        params.end().ok()?;
        Some(size)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.binary_remaining > 0 {
                if src.is_empty() {
                    return Ok(None);
                }
                let take = self.binary_remaining.min(src.len());
                self.binary_remaining -= take;
                return Ok(Some(Frame::Data(src.split_to(take).freeze())));
            }

            let newline = src[self.next_index..].iter().position(|b| *b == b'\n');
            let Some(offset) = newline else {
                self.next_index = src.len();
                if src.len() > MAX_LINE_SIZE {
                    return Err(CodecError::LineTooLong {
                        size: src.len(),
                        max: MAX_LINE_SIZE,
                    });
                }
                return Ok(None);
            };

            let end = self.next_index + offset;
            self.next_index = 0;
            let raw = src.split_to(end + 1);
            let mut body = &raw[..end];
            while let Some((last, rest)) = body.split_last() {
                if *last == b'\r' {
                    body = rest;
                } else {
                    break;
                }
            }
            let line = std::str::from_utf8(body)
                .map_err(|_| CodecError::InvalidUtf8)?
                .trim_start();
            if line.is_empty() {
                continue;
            }
            if let Some(size) = Self::data_header_size(line) {
                self.binary_remaining = size;
            }
            return Ok(Some(Frame::Line(line.to_string())));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let frame = self.decode(buf)?;
        if frame.is_none() {
            // an unterminated trailing line is dropped with the stream
            buf.clear();
            self.next_index = 0;
        }
        Ok(frame)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Frame::Line(line) => {
                if line.len() > MAX_LINE_SIZE {
                    return Err(CodecError::LineTooLong {
                        size: line.len(),
                        max: MAX_LINE_SIZE,
                    });
                }
                dst.reserve(line.len() + 1);
                dst.put_slice(line.as_bytes());
                dst.put_u8(b'\n');
            }
            Frame::Data(data) => {
                dst.reserve(data.len());
                dst.put_slice(&data);
            }
        }
        Ok(())
    }
}
