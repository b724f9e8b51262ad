//! Command Layer
//!
//! Turns decoded request frames into store calls and response envelopes.
//!
//! ## Architecture
//!
//! ```text
//! Request frame
//!       │
//!       ▼
//! ┌─────────────────┐
//! │   RawCommand    │  header: tag, request id, command id, version
//! └────────┬────────┘
//!          │ tag lookup (COMMAND_TABLE)
//!          ▼
//! ┌─────────────────┐      ┌───────────────────────────────┐
//! │ CommandExecutor │─────>│ execute_command(handler, ...) │
//! └─────────────────┘      │  parse ─> execute ─> respond  │
//!                          │  timing · stats · audit       │
//!                          └───────────────┬───────────────┘
//!                                          ▼
//!                        InitializeHandler | BulkMutateHandler
//!                                          │
//!                                          ▼
//!                                     CacheStore
//! ```
//!
//! ## Supported Commands
//!
//! - `INIT` - session handshake
//! - `ADDBULK` - add many keys, failing those that already exist
//! - `INSERTBULK` - add or overwrite many keys

pub mod audit;
pub mod bulk;
pub mod contract;
pub mod handler;
pub mod initialize;
pub mod request;
pub mod response;
pub mod stats;

pub use audit::{AuditEntry, AuditError, AuditSink, TracingAuditSink};
pub use bulk::{BulkMutateHandler, BulkMutateRequest};
pub use contract::{execute_command, CommandError, CommandHandler, CommandServices, SetupError};
pub use handler::CommandExecutor;
pub use initialize::{DeploymentPolicy, InitializeHandler, InitializeRequest};
pub use request::{ParseError, RawCommand};
pub use response::{Response, ResponseBody, ResponseBuilder};
pub use stats::CommandStats;

use std::fmt;

/// The closed set of commands this layer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Initialize,
    AddBulk,
    InsertBulk,
}

/// Wire tag for every command kind.
const COMMAND_TABLE: [(&str, CommandKind); CommandKind::COUNT] = [
    ("INIT", CommandKind::Initialize),
    ("ADDBULK", CommandKind::AddBulk),
    ("INSERTBULK", CommandKind::InsertBulk),
];

impl CommandKind {
    pub const COUNT: usize = 3;

    pub const ALL: [CommandKind; Self::COUNT] = [
        CommandKind::Initialize,
        CommandKind::AddBulk,
        CommandKind::InsertBulk,
    ];

    /// Resolves a (case-insensitive) wire tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        COMMAND_TABLE
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(tag))
            .map(|(_, kind)| *kind)
    }

    pub fn tag(self) -> &'static str {
        COMMAND_TABLE[self.index()].0
    }

    /// Dense index, stable for the lifetime of the process.
    pub fn index(self) -> usize {
        match self {
            CommandKind::Initialize => 0,
            CommandKind::AddBulk => 1,
            CommandKind::InsertBulk => 2,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}
