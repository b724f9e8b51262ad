//! Incremental Frame Parser
//!
//! The connection task appends socket reads to a buffer and calls
//! [`FrameParser::parse`] until it returns `Ok(None)`:
//!
//! - `Ok(Some((frame, consumed)))` - one complete frame, advance by `consumed`
//! - `Ok(None)` - the frame is incomplete, read more
//! - `Err(FrameError)` - the byte stream is corrupt, drop the connection

use crate::protocol::types::{prefix, Frame, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur while decoding a frame.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    /// Unknown type prefix byte
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    /// A length or integer line did not hold an integer
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid UTF-8 in a simple string or error line
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Negative length other than the -1 null marker
    #[error("invalid length: {0}")]
    InvalidLength(i64),

    /// Missing CRLF or nesting too deep
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Bulk payload larger than allowed
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
}

pub type FrameResult<T> = Result<T, FrameError>;

/// Maximum size of one bulk payload (64 MB)
pub const MAX_BULK_SIZE: usize = 64 * 1024 * 1024;

/// Maximum array nesting depth. A bulk request nests three levels deep.
pub const MAX_NESTING_DEPTH: usize = 8;

/// A stateless-between-calls frame parser.
#[derive(Debug, Default)]
pub struct FrameParser {
    depth: usize,
}

impl FrameParser {
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Attempts to decode one frame from the front of `buf`.
    pub fn parse(&mut self, buf: &[u8]) -> FrameResult<Option<(Frame, usize)>> {
        self.depth = 0;
        self.parse_value(buf)
    }

    fn parse_value(&mut self, buf: &[u8]) -> FrameResult<Option<(Frame, usize)>> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };

        if self.depth > MAX_NESTING_DEPTH {
            return Err(FrameError::ProtocolError(format!(
                "maximum nesting depth exceeded: {}",
                MAX_NESTING_DEPTH
            )));
        }

        let Some((line, header_len)) = read_line(buf)? else {
            return Ok(None);
        };

        match first {
            prefix::SIMPLE_STRING => Ok(Some((Frame::SimpleString(line.to_string()), header_len))),
            prefix::ERROR => Ok(Some((Frame::Error(line.to_string()), header_len))),
            prefix::INTEGER => Ok(Some((Frame::Integer(parse_int(line)?), header_len))),
            prefix::BULK => parse_bulk(buf, parse_int(line)?, header_len),
            prefix::ARRAY => self.parse_array(buf, parse_int(line)?, header_len),
            other => Err(FrameError::UnknownPrefix(other)),
        }
    }

    fn parse_array(
        &mut self,
        buf: &[u8],
        count: i64,
        header_len: usize,
    ) -> FrameResult<Option<(Frame, usize)>> {
        if count == -1 {
            return Ok(Some((Frame::Null, header_len)));
        }
        if count < 0 {
            return Err(FrameError::InvalidLength(count));
        }

        let count = count as usize;
        // Never trust the declared count for preallocation.
        let mut elements = Vec::with_capacity(count.min(1024));
        let mut consumed = header_len;

        self.depth += 1;
        for _ in 0..count {
            match self.parse_value(&buf[consumed..])? {
                Some((value, used)) => {
                    elements.push(value);
                    consumed += used;
                }
                None => return Ok(None),
            }
        }
        self.depth -= 1;

        Ok(Some((Frame::Array(elements), consumed)))
    }
}

fn parse_bulk(buf: &[u8], length: i64, header_len: usize) -> FrameResult<Option<(Frame, usize)>> {
    if length == -1 {
        return Ok(Some((Frame::Null, header_len)));
    }
    if length < 0 {
        return Err(FrameError::InvalidLength(length));
    }

    let length = length as usize;
    if length > MAX_BULK_SIZE {
        return Err(FrameError::FrameTooLarge {
            size: length,
            max: MAX_BULK_SIZE,
        });
    }

    let total = header_len + length + CRLF.len();
    if buf.len() < total {
        return Ok(None);
    }
    if &buf[header_len + length..total] != CRLF {
        return Err(FrameError::ProtocolError(
            "bulk payload missing trailing CRLF".to_string(),
        ));
    }

    let data = Bytes::copy_from_slice(&buf[header_len..header_len + length]);
    Ok(Some((Frame::Bulk(data), total)))
}

/// Reads the header line after the prefix byte. Returns the line text and the
/// number of bytes including prefix and CRLF.
fn read_line(buf: &[u8]) -> FrameResult<Option<(&str, usize)>> {
    let body = &buf[1..];
    let Some(pos) = body.windows(2).position(|w| w == CRLF) else {
        return Ok(None);
    };
    let line =
        std::str::from_utf8(&body[..pos]).map_err(|e| FrameError::InvalidUtf8(e.to_string()))?;
    Ok(Some((line, 1 + pos + CRLF.len())))
}

fn parse_int(line: &str) -> FrameResult<i64> {
    line.parse()
        .map_err(|_| FrameError::InvalidInteger(line.to_string()))
}

/// Decodes a single frame with a fresh parser.
pub fn parse_frame(buf: &[u8]) -> FrameResult<Option<(Frame, usize)>> {
    FrameParser::new().parse(buf)
}
