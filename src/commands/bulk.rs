//! Bulk mutations (`ADDBULK`, `INSERTBULK`).
//!
//! A batch is submitted to the store as one call with one
//! [`OperationContext`]. Once the store has answered, every failure is
//! reported per key inside a success-shaped response; only a malformed
//! batch or a store error raised before any key was processed produces an
//! exception response.
//!
//! Request fields, after the common header:
//!
//! ```text
//!  0 keys            [key, ...]
//!  1 entries         [[value, absolute_ms, sliding_ms, priority, [tag, ...]], ...]
//!  2 flags           write-thru 0x01 | write-behind 0x02
//!  3 provider        4 intended_recipient   5 client_last_view_id
//!  6 return_version  7 method_overload      8 group        9 subgroup
//! 10 update_callback_id   11 ds_added_callback_id   12 resync_provider
//! ```

use crate::commands::audit::AuditEntry;
use crate::commands::request::bytes_at;
use crate::commands::response::BulkMutateResponse;
use crate::commands::{
    CommandError, CommandHandler, CommandKind, ParseError, RawCommand, ResponseBody, SetupError,
};
use crate::protocol::Frame;
use crate::session::ClientConnection;
use crate::storage::{CacheEntry, Expiration, MutationFlags, MutationKind, OperationContext};
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

mod field {
    pub const KEYS: usize = 0;
    pub const ENTRIES: usize = 1;
    pub const FLAGS: usize = 2;
    pub const PROVIDER: usize = 3;
    pub const INTENDED_RECIPIENT: usize = 4;
    pub const CLIENT_LAST_VIEW_ID: usize = 5;
    pub const RETURN_VERSION: usize = 6;
    pub const METHOD_OVERLOAD: usize = 7;
    pub const GROUP: usize = 8;
    pub const SUBGROUP: usize = 9;
    pub const UPDATE_CALLBACK_ID: usize = 10;
    pub const DS_ADDED_CALLBACK_ID: usize = 11;
    pub const RESYNC_PROVIDER: usize = 12;
}

/// Decoded bulk mutation. `keys` and `entries` always have the same, non-zero length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkMutateRequest {
    pub keys: Vec<Bytes>,
    pub entries: Vec<CacheEntry>,
    pub flags: MutationFlags,
    pub provider: Option<String>,
    pub intended_recipient: Option<String>,
    pub client_last_view_id: i64,
    pub return_version: bool,
    pub method_overload: i64,
    pub group: Option<String>,
    pub subgroup: Option<String>,
    pub update_callback_id: i64,
    pub ds_added_callback_id: i64,
    pub resync_provider: Option<String>,
}

/// Handles one of the two bulk commands, chosen at construction.
#[derive(Debug, Clone, Copy)]
pub struct BulkMutateHandler {
    kind: MutationKind,
}

impl BulkMutateHandler {
    pub fn new(kind: MutationKind) -> Self {
        Self { kind }
    }

    pub fn add() -> Self {
        Self::new(MutationKind::Add)
    }

    pub fn insert() -> Self {
        Self::new(MutationKind::Insert)
    }
}

fn parse_expiration(ms: Option<&Frame>, name: &'static str) -> Result<Option<u64>, ParseError> {
    match ms.filter(|f| !f.is_null()) {
        None => Ok(None),
        Some(frame) => {
            let value = frame.as_integer().ok_or_else(|| ParseError::InvalidField {
                field: name,
                reason: "expected milliseconds".to_string(),
            })?;
            // Zero or negative means "no expiration".
            Ok(u64::try_from(value).ok().filter(|ms| *ms > 0))
        }
    }
}

fn parse_entry(frame: &Frame) -> Result<CacheEntry, ParseError> {
    let items = frame.as_array().ok_or_else(|| ParseError::InvalidField {
        field: "entries",
        reason: "each entry must be an array".to_string(),
    })?;

    let value = bytes_at(items, 0, "entries.value")?;
    let expiration = Expiration {
        absolute_ms: parse_expiration(items.get(1), "entries.absolute_ms")?,
        sliding_ms: parse_expiration(items.get(2), "entries.sliding_ms")?,
    };
    if expiration.absolute_ms.is_some() && expiration.sliding_ms.is_some() {
        return Err(ParseError::InvalidField {
            field: "entries",
            reason: "absolute and sliding expiration cannot both be set".to_string(),
        });
    }
    let priority = match items.get(3).filter(|f| !f.is_null()) {
        Some(frame) => frame.as_integer().ok_or_else(|| ParseError::InvalidField {
            field: "entries.priority",
            reason: "expected an integer".to_string(),
        })?,
        None => 0,
    };
    let tags = match items.get(4).and_then(Frame::as_array) {
        Some(tags) => tags
            .iter()
            .map(|tag| {
                tag.as_str().map(str::to_string).ok_or_else(|| ParseError::InvalidField {
                    field: "entries.tags",
                    reason: "tags must be strings".to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };

    Ok(CacheEntry {
        value,
        expiration,
        priority,
        tags,
    })
}

fn owned(value: Option<&str>) -> Option<String> {
    value.filter(|s| !s.is_empty()).map(str::to_string)
}

impl CommandHandler for BulkMutateHandler {
    type Request = BulkMutateRequest;

    fn kind(&self) -> CommandKind {
        match self.kind {
            MutationKind::Add => CommandKind::AddBulk,
            MutationKind::Insert => CommandKind::InsertBulk,
        }
    }

    fn parse(&self, raw: &RawCommand, _conn: &ClientConnection) -> Result<BulkMutateRequest, ParseError> {
        let key_frames = raw.required_array(field::KEYS, "keys")?;
        let entry_frames = raw.required_array(field::ENTRIES, "entries")?;

        if key_frames.len() != entry_frames.len() {
            return Err(ParseError::LengthMismatch {
                keys: key_frames.len(),
                entries: entry_frames.len(),
            });
        }
        if key_frames.is_empty() {
            return Err(ParseError::EmptyBatch);
        }

        let keys = (0..key_frames.len())
            .map(|i| bytes_at(key_frames, i, "keys"))
            .collect::<Result<Vec<_>, _>>()?;
        let entries = entry_frames
            .iter()
            .map(parse_entry)
            .collect::<Result<Vec<_>, _>>()?;

        let flags = u32::try_from(raw.optional_int(field::FLAGS, "flags", 0)?)
            .map(MutationFlags::from_bits)
            .map_err(|_| ParseError::InvalidField {
                field: "flags",
                reason: "not a valid bit set".to_string(),
            })?;

        Ok(BulkMutateRequest {
            keys,
            entries,
            flags,
            provider: owned(raw.optional_str(field::PROVIDER, "provider")?),
            intended_recipient: owned(raw.optional_str(field::INTENDED_RECIPIENT, "intended_recipient")?),
            client_last_view_id: raw.optional_int(field::CLIENT_LAST_VIEW_ID, "client_last_view_id", -1)?,
            return_version: raw.flag(field::RETURN_VERSION, "return_version")?,
            method_overload: raw.optional_int(field::METHOD_OVERLOAD, "method_overload", 0)?,
            group: owned(raw.optional_str(field::GROUP, "group")?),
            subgroup: owned(raw.optional_str(field::SUBGROUP, "subgroup")?),
            update_callback_id: raw.optional_int(field::UPDATE_CALLBACK_ID, "update_callback_id", -1)?,
            ds_added_callback_id: raw.optional_int(field::DS_ADDED_CALLBACK_ID, "ds_added_callback_id", -1)?,
            resync_provider: owned(raw.optional_str(field::RESYNC_PROVIDER, "resync_provider")?),
        })
    }

    fn execute(
        &self,
        conn: &mut ClientConnection,
        _raw: &RawCommand,
        request: &BulkMutateRequest,
    ) -> Result<ResponseBody, CommandError> {
        let session = conn.session().ok_or(SetupError::NotInitialized)?;

        let context = OperationContext {
            operation: self.kind,
            raise_notification: true,
            client_last_view_id: request.client_last_view_id,
            write_thru: request.flags.write_thru(),
            write_behind: request.flags.write_behind(),
            intended_recipient: request.intended_recipient.clone(),
        };

        let outcome = session.cache().bulk_mutate(
            &request.keys,
            &request.entries,
            request.flags,
            request.provider.as_deref(),
            &context,
        )?;

        debug!(
            client_id = %session.client_id(),
            command = %self.kind(),
            keys = request.keys.len(),
            failed = outcome.failed_count(),
            "Bulk mutation applied"
        );

        Ok(ResponseBody::BulkMutate {
            kind: self.kind(),
            body: BulkMutateResponse::from_outcome(
                outcome,
                request.return_version,
                request.intended_recipient.clone(),
            ),
        })
    }

    fn audit_entry(
        &self,
        conn: &ClientConnection,
        request: &BulkMutateRequest,
        elapsed: Duration,
        error: Option<&CommandError>,
    ) -> Option<AuditEntry> {
        let first = request.entries.first()?;
        Some(AuditEntry {
            method: self.kind.method_name(),
            key_count: request.keys.len(),
            value_count: request.entries.len(),
            expiration: first.expiration,
            priority: first.priority,
            tags: first.tags.clone(),
            group: request.group.clone(),
            subgroup: request.subgroup.clone(),
            provider: request.provider.clone(),
            resync_provider: request.resync_provider.clone(),
            method_overload: request.method_overload,
            update_callback_id: request.update_callback_id,
            ds_added_callback_id: request.ds_added_callback_id,
            exception: error.map(ToString::to_string),
            elapsed,
            client_id: conn
                .session()
                .map(|s| s.client_id().to_string())
                .unwrap_or_default(),
            client_address: conn.peer(),
        })
    }
}
