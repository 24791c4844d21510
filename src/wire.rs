//! Wire framing for the UCS link
//!
//! # TCP Protocol
//!
//! Every message is a protobuf-encoded [`VsmMessage`] framed by a varint
//! length header:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────┐
//! │ Length (1..=5 bytes) │ Payload (variable)       │
//! │ base-128 varint, LE  │ Protobuf binary          │
//! └──────────────────────┴──────────────────────────┘
//! ```
//!
//! ## Framing
//!
//! - **Length header**: base-128 little-endian varint, continuation bit 0x80
//!   on all but the final byte, at most 5 bytes
//! - **Payload**: protobuf-encoded [`VsmMessage`]; a zero-length payload is a
//!   valid no-op message
//! - **Maximum payload size**: configured bound, default 1 MiB; a header that
//!   decodes past the bound is fatal for the connection
//!
//! The decoder consumes the header one byte at a time, so any header byte can
//! be a frame boundary on the async byte stream. [`ReadState`] tells the
//! reader exactly how many bytes to request next.

use crate::error::{Error, Result};
use crate::proto::VsmMessage;
use prost::Message;
use std::fmt;
use std::io::ErrorKind;

/// Default bound on a single frame payload.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// A u32 varint never needs more than 5 bytes; a continuation bit past that
/// point is a protocol error.
const MAX_VARINT_SHIFT: u32 = 35;

/// Classified outcome of a stream operation, driving the close path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Ok,
    EndOfFile,
    Canceled,
    Closed,
    PermissionDenied,
    OtherFailure,
}

impl IoStatus {
    pub fn from_error(err: &std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::UnexpectedEof => IoStatus::EndOfFile,
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => IoStatus::Closed,
            ErrorKind::Interrupted => IoStatus::Canceled,
            ErrorKind::PermissionDenied => IoStatus::PermissionDenied,
            _ => IoStatus::OtherFailure,
        }
    }
}

impl fmt::Display for IoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IoStatus::Ok => "ok",
            IoStatus::EndOfFile => "end of file",
            IoStatus::Canceled => "canceled",
            IoStatus::Closed => "closed",
            IoStatus::PermissionDenied => "permission denied",
            IoStatus::OtherFailure => "other failure",
        };
        f.write_str(name)
    }
}

/// Append `n` as a base-128 little-endian varint.
pub fn encode_varint(mut n: u32, out: &mut Vec<u8>) {
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decode a varint from the front of `bytes`, returning the value and the
/// number of header bytes consumed.
pub fn decode_varint(bytes: &[u8]) -> Result<(u32, usize)> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            if value > u64::from(u32::MAX) {
                return Err(Error::VarintOverflow);
            }
            return Ok((value as u32, i + 1));
        }
        shift += 7;
        if shift >= MAX_VARINT_SHIFT {
            return Err(Error::VarintOverflow);
        }
    }
    Err(Error::VarintOverflow)
}

/// Serialize a message into a single outbound buffer: varint length followed
/// by the protobuf payload.
pub fn encode_frame(msg: &VsmMessage) -> Vec<u8> {
    let payload = msg.encode_to_vec();
    let mut buf = Vec::with_capacity(payload.len() + 5);
    encode_varint(payload.len() as u32, &mut buf);
    buf.extend_from_slice(&payload);
    buf
}

/// Result of feeding bytes to [`ReadState`].
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// Header byte consumed, or body phase entered; read `next_read_size()`
    /// more bytes.
    NeedMore,
    /// A complete frame payload. May be empty.
    Frame(Vec<u8>),
}

/// Per-connection receive state machine.
///
/// In the header phase exactly one byte is requested at a time; each byte
/// contributes its low seven bits to `message_size` at the current `shift`.
/// In the body phase exactly `message_size` bytes are requested. A header
/// that evaluates to zero yields an empty frame and re-enters the header
/// phase; a header past `max_len` is a fatal protocol error.
#[derive(Debug)]
pub struct ReadState {
    reading_header: bool,
    to_read: usize,
    shift: u32,
    message_size: usize,
    max_len: usize,
}

impl ReadState {
    pub fn new(max_len: usize) -> Self {
        ReadState {
            reading_header: true,
            to_read: 1,
            shift: 0,
            message_size: 0,
            max_len,
        }
    }

    /// How many bytes the reader must obtain before the next `feed` call.
    pub fn next_read_size(&self) -> usize {
        self.to_read
    }

    /// Consume exactly `next_read_size()` bytes.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Decoded> {
        debug_assert_eq!(bytes.len(), self.to_read);
        if !self.reading_header {
            let frame = bytes.to_vec();
            self.reset();
            return Ok(Decoded::Frame(frame));
        }

        let byte = bytes[0];
        self.message_size |= usize::from(byte & 0x7f) << self.shift;
        if byte & 0x80 != 0 {
            self.shift += 7;
            if self.shift >= MAX_VARINT_SHIFT {
                return Err(Error::VarintOverflow);
            }
            return Ok(Decoded::NeedMore);
        }

        // Header complete.
        if self.message_size > self.max_len {
            return Err(Error::FrameTooLarge {
                max: self.max_len,
                got: self.message_size,
            });
        }
        if self.message_size == 0 {
            self.reset();
            return Ok(Decoded::Frame(Vec::new()));
        }
        self.reading_header = false;
        self.to_read = self.message_size;
        Ok(Decoded::NeedMore)
    }

    fn reset(&mut self) {
        self.reading_header = true;
        self.to_read = 1;
        self.shift = 0;
        self.message_size = 0;
    }
}
