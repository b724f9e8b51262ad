//! Frame Data Types
//!
//! Requests, responses and pushed events travel as RESP-encoded frames.
//! The command layer never looks at bytes: it only sees decoded [`Frame`]
//! trees and hands back [`Frame`] trees to be written.
//!
//! ## Encoding
//!
//! - `+` simple string, `-` error, `:` integer
//! - `$<len>` bulk (binary-safe), `$-1` null
//! - `*<count>` array
//!
//! Every element ends with CRLF.

use bytes::Bytes;
use std::fmt;

/// The CRLF terminator
pub const CRLF: &[u8] = b"\r\n";

/// Type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK: u8 = b'$';
    pub const ARRAY: u8 = b'*';
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Short, non-binary text. Format: `+<string>\r\n`
    SimpleString(String),

    /// Frame-level error with no correlation ids. Format: `-<message>\r\n`
    Error(String),

    /// Signed 64-bit integer. Format: `:<n>\r\n`
    Integer(i64),

    /// Binary-safe payload. Format: `$<len>\r\n<data>\r\n`
    Bulk(Bytes),

    /// Absent value (`$-1` or `*-1`)
    Null,

    /// Ordered, possibly nested, sequence of frames
    Array(Vec<Frame>),
}

impl Frame {
    pub fn simple(s: impl Into<String>) -> Self {
        Frame::SimpleString(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        Frame::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        Frame::Integer(n)
    }

    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::Bulk(data.into())
    }

    /// A bulk frame from an optional string; `None` becomes [`Frame::Null`].
    pub fn optional_bulk(value: Option<&str>) -> Self {
        match value {
            Some(s) => Frame::Bulk(Bytes::copy_from_slice(s.as_bytes())),
            None => Frame::Null,
        }
    }

    pub fn boolean(flag: bool) -> Self {
        Frame::Integer(i64::from(flag))
    }

    pub fn array(values: Vec<Frame>) -> Self {
        Frame::Array(values)
    }

    /// Serializes the frame to its wire representation.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the frame into an existing buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::SimpleString(s) => {
                buf.push(prefix::SIMPLE_STRING);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Frame::Error(s) => {
                buf.push(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Frame::Integer(n) => {
                buf.push(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Frame::Bulk(data) => {
                buf.push(prefix::BULK);
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            Frame::Null => {
                buf.push(prefix::BULK);
                buf.extend_from_slice(b"-1");
                buf.extend_from_slice(CRLF);
            }
            Frame::Array(values) => {
                buf.push(prefix::ARRAY);
                buf.extend_from_slice(values.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF);
                for value in values {
                    value.serialize_into(buf);
                }
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null)
    }

    /// Text content of a simple string or UTF-8 bulk.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Frame::SimpleString(s) => Some(s),
            Frame::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Raw payload of a bulk or simple string.
    pub fn as_bytes(&self) -> Option<Bytes> {
        match self {
            Frame::Bulk(b) => Some(b.clone()),
            Frame::SimpleString(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
            _ => None,
        }
    }

    /// Integer content; textual integers are accepted too.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Frame::Integer(n) => Some(*n),
            Frame::Bulk(b) => std::str::from_utf8(b).ok().and_then(|s| s.parse().ok()),
            Frame::SimpleString(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Frame]> {
        match self {
            Frame::Array(values) => Some(values),
            _ => None,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::SimpleString(s) => write!(f, "\"{}\"", s),
            Frame::Error(s) => write!(f, "(error) {}", s),
            Frame::Integer(n) => write!(f, "(integer) {}", n),
            Frame::Bulk(data) => match std::str::from_utf8(data) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "(binary data, {} bytes)", data.len()),
            },
            Frame::Null => write!(f, "(nil)"),
            Frame::Array(values) => {
                write!(f, "[")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
        }
    }
}
