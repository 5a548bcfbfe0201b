//! Frame Codec
//!
//! Sensors send measurements as tag-length-value packets:
//!
//! ```text
//! +-----+----------------+-------------------+
//! | tag | length (LEB128)| payload (length)  |
//! +-----+----------------+-------------------+
//!   1B      1..=4 bytes
//! ```
//!
//! `FrameCodec` splits a byte stream into `Frame`s without looking at the
//! payload. Readers subscribe to one tag and skip the rest.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Tag the sensors use for measurement packets
pub const DEFAULT_OBSERVE_TAG: u8 = 0x10;

/// Largest payload accepted from a connection (1 MiB)
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Length prefix never exceeds 4 varint bytes (28 bits)
const VARINT_BYTES_MAX: usize = 4;

/// One raw, not-yet-decoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(tag: u8, payload: impl Into<Bytes>) -> Self {
        Frame {
            tag,
            payload: payload.into(),
        }
    }

    /// Append the wire representation of this frame to `dst`
    pub fn encode_to(&self, dst: &mut BytesMut) {
        dst.reserve(1 + VARINT_BYTES_MAX + self.payload.len());
        dst.put_u8(self.tag);
        put_varint(self.payload.len(), dst);
        dst.extend_from_slice(&self.payload);
    }
}

/// Error type for framing failures. All variants end the connection.
#[derive(Debug)]
pub enum FrameError {
    /// Length prefix longer than 4 bytes
    MalformedLength,
    /// Declared payload exceeds the codec limit
    Oversized { len: usize, max: usize },
    /// Underlying transport failed
    Io(std::io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::MalformedLength => write!(f, "malformed frame length prefix"),
            FrameError::Oversized { len, max } => {
                write!(f, "frame of {} bytes exceeds limit of {} bytes", len, max)
            }
            FrameError::Io(e) => write!(f, "connection I/O error: {}", e),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Read an unsigned LEB128 length from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the value and the
/// number of bytes it occupied.
pub fn read_varint(buf: &[u8]) -> Result<Option<(usize, usize)>, FrameError> {
    let mut value: usize = 0;
    for (i, byte) in buf.iter().take(VARINT_BYTES_MAX).enumerate() {
        value |= ((byte & 0x7f) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= VARINT_BYTES_MAX {
        return Err(FrameError::MalformedLength);
    }
    Ok(None)
}

/// Write `value` as an unsigned LEB128 varint
pub fn put_varint(mut value: usize, dst: &mut BytesMut) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | 0x80);
    }
}

/// tokio-util codec for TLV frames
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_len: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_len(MAX_FRAME_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        FrameCodec { max_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let (len, len_bytes) = match read_varint(&src[1..])? {
            Some(parsed) => parsed,
            None => return Ok(None),
        };
        if len > self.max_len {
            return Err(FrameError::Oversized {
                len,
                max: self.max_len,
            });
        }

        let header = 1 + len_bytes;
        let total = header + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let tag = src[0];
        src.advance(header);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { tag, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.payload.len() > self.max_len {
            return Err(FrameError::Oversized {
                len: frame.payload.len(),
                max: self.max_len,
            });
        }
        frame.encode_to(dst);
        Ok(())
    }
}
