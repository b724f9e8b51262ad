//! Connection Module
//!
//! Transport side of the gate. Every accepted socket gets its own async
//! task which decodes frames, hands them to the shared
//! [`CommandExecutor`](crate::commands::CommandExecutor) and writes the
//! replies back. Once a client has completed its handshake the same task
//! also forwards cache events to it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener                            │
//! │                    (main.rs)                                │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ accept() + spawn task
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────────┐  │
//! │  │ Read bytes  │───>│ Parse frame │───>│ CommandExecutor │  │
//! │  └─────────────┘    └─────────────┘    └────────┬────────┘  │
//! │                                                 ▼           │
//! │  ┌─────────────┐                       ┌─────────────┐      │
//! │  │ Event queue │──────────────────────>│ Write frame │      │
//! │  └─────────────┘                       └─────────────┘      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use flashgate::connection::{handle_connection, ConnectionStats};
//! use std::sync::Arc;
//!
//! let stats = Arc::new(ConnectionStats::new());
//! let (stream, addr) = listener.accept().await?;
//! tokio::spawn(handle_connection(stream, addr, Arc::clone(&executor), stats, true));
//! ```

pub mod handler;

pub use handler::{handle_connection, ConnectionError, ConnectionHandler, ConnectionStats};
