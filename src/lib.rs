//! # FlashGate - Client Command Layer for an In-Memory Cache
//!
//! FlashGate is the part of a distributed cache server that clients talk
//! to. It accepts connections, runs the handshake that turns a socket into
//! a registered client session, executes bulk add and insert commands
//! against the cache store and pushes cache events back to clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Client (TCP)                           │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ frames
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  connection::ConnectionHandler (one task per client)        │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  commands::CommandExecutor                                  │
//! │     INIT ──────> InitializeHandler ──> SessionRegistry      │
//! │     ADDBULK ───> BulkMutateHandler ──> CacheStore           │
//! │     INSERTBULK ┘                                            │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  storage::MemoryCache (64 shards)  ──> session::EventHub    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Commands
//!
//! - `INIT`: handshake. Validates the deployment policy, opens the cache,
//!   registers the session (replacing any earlier session with the same
//!   client id) and reports cache properties and draining nodes.
//! - `ADDBULK`: stores keys that do not exist yet; existing keys fail
//!   individually.
//! - `INSERTBULK`: stores keys, overwriting existing values.
//!
//! Every request carries a request id and a command id, and every reply
//! echoes both, failures included.
//!
//! ## Module Overview
//!
//! - [`protocol`]: frame codec used on the wire
//! - [`commands`]: command contract, handlers and response building
//! - [`session`]: sessions, the session registry and event delivery
//! - [`storage`]: store traits and the in-memory cache
//! - [`connection`]: per-client connection tasks
//! - [`config`]: server configuration and command line

pub mod commands;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod session;
pub mod storage;

pub use commands::{CommandExecutor, CommandServices, InitializeHandler};
pub use config::{Cli, ServerConfig};
pub use connection::{handle_connection, ConnectionStats};
pub use protocol::{Frame, FrameError, FrameParser};
pub use session::{EventHub, SessionRegistry};
pub use storage::{start_expiry_sweeper, ExpirySweeper, MemoryCache, MemoryCatalog};

/// The default port FlashGate listens on
pub const DEFAULT_PORT: u16 = 9800;

/// The default host FlashGate binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of FlashGate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
