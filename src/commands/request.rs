//! Raw command decoding.
//!
//! Every request frame is an array led by a fixed header:
//!
//! ```text
//! [ TAG, request_id, command_id, command_version, field0, field1, ... ]
//! ```
//!
//! [`RawCommand`] splits the header off and offers typed accessors over the
//! positional fields. Handlers turn a `RawCommand` into their own request
//! type; anything missing or malformed surfaces as a [`ParseError`].

use crate::protocol::Frame;
use bytes::Bytes;
use thiserror::Error;

/// Errors raised while decoding a command.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("command frame must be an array")]
    NotAnArray,

    #[error("command header is missing or malformed: {0}")]
    MissingHeader(&'static str),

    #[error("required field '{0}' is missing")]
    MissingField(&'static str),

    #[error("field '{field}' is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("bulk operation requires at least one key")]
    EmptyBatch,

    #[error("bulk operation has {keys} keys but {entries} entries")]
    LengthMismatch { keys: usize, entries: usize },

    #[error("unknown command '{0}'")]
    UnknownCommand(String),
}

impl ParseError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ParseError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// A decoded request header plus its still-untyped fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCommand {
    tag: String,
    request_id: i64,
    command_id: i64,
    command_version: i32,
    fields: Vec<Frame>,
}

impl RawCommand {
    pub fn new(
        tag: impl Into<String>,
        request_id: i64,
        command_id: i64,
        command_version: i32,
        fields: Vec<Frame>,
    ) -> Self {
        Self {
            tag: tag.into(),
            request_id,
            command_id,
            command_version,
            fields,
        }
    }

    /// Splits a request frame into header and fields.
    pub fn from_frame(frame: Frame) -> Result<Self, ParseError> {
        let Frame::Array(items) = frame else {
            return Err(ParseError::NotAnArray);
        };
        let mut items = items.into_iter();

        let tag = items
            .next()
            .and_then(|f| f.as_str().map(str::to_ascii_uppercase))
            .ok_or(ParseError::MissingHeader("tag"))?;
        let request_id = items
            .next()
            .and_then(|f| f.as_integer())
            .ok_or(ParseError::MissingHeader("request_id"))?;
        let command_id = items
            .next()
            .and_then(|f| f.as_integer())
            .ok_or(ParseError::MissingHeader("command_id"))?;
        let command_version = items
            .next()
            .and_then(|f| f.as_integer())
            .and_then(|v| i32::try_from(v).ok())
            .ok_or(ParseError::MissingHeader("command_version"))?;

        Ok(Self {
            tag,
            request_id,
            command_id,
            command_version,
            fields: items.collect(),
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn request_id(&self) -> i64 {
        self.request_id
    }

    pub fn command_id(&self) -> i64 {
        self.command_id
    }

    pub fn command_version(&self) -> i32 {
        self.command_version
    }

    pub fn fields(&self) -> &[Frame] {
        &self.fields
    }

    /// A field that is present and not null.
    fn present(&self, index: usize) -> Option<&Frame> {
        self.fields.get(index).filter(|f| !f.is_null())
    }

    pub fn required_str(&self, index: usize, name: &'static str) -> Result<&str, ParseError> {
        self.optional_str(index, name)?
            .ok_or(ParseError::MissingField(name))
    }

    pub fn optional_str(&self, index: usize, name: &'static str) -> Result<Option<&str>, ParseError> {
        self.present(index)
            .map(|f| f.as_str().ok_or_else(|| ParseError::invalid(name, "expected a string")))
            .transpose()
    }

    pub fn required_int(&self, index: usize, name: &'static str) -> Result<i64, ParseError> {
        let frame = self.present(index).ok_or(ParseError::MissingField(name))?;
        frame
            .as_integer()
            .ok_or_else(|| ParseError::invalid(name, "expected an integer"))
    }

    pub fn optional_int(&self, index: usize, name: &'static str, default: i64) -> Result<i64, ParseError> {
        match self.present(index) {
            Some(frame) => frame
                .as_integer()
                .ok_or_else(|| ParseError::invalid(name, "expected an integer")),
            None => Ok(default),
        }
    }

    /// A boolean encoded as an integer; absent means `false`.
    pub fn flag(&self, index: usize, name: &'static str) -> Result<bool, ParseError> {
        self.optional_int(index, name, 0).map(|v| v != 0)
    }

    pub fn required_array(&self, index: usize, name: &'static str) -> Result<&[Frame], ParseError> {
        self.optional_array(index, name)?
            .ok_or(ParseError::MissingField(name))
    }

    pub fn optional_array(&self, index: usize, name: &'static str) -> Result<Option<&[Frame]>, ParseError> {
        self.present(index)
            .map(|f| f.as_array().ok_or_else(|| ParseError::invalid(name, "expected an array")))
            .transpose()
    }
}

/// Reads a binary element of an array field.
pub(crate) fn bytes_at(items: &[Frame], index: usize, name: &'static str) -> Result<Bytes, ParseError> {
    items
        .get(index)
        .and_then(Frame::as_bytes)
        .ok_or_else(|| ParseError::invalid(name, format!("element {} is not a bulk value", index)))
}
