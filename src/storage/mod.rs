//! Store Collaborator Boundary
//!
//! The command layer never reaches into a cache's internals. It talks to a
//! [`CacheStore`] obtained from a [`CacheCatalog`] during the handshake, and
//! everything it hands over or gets back is defined here.
//!
//! ```text
//!  InitializeHandler ──open()──> CacheCatalog ──> Arc<dyn CacheStore>
//!                                                        │
//!  BulkMutateHandler ──bulk_mutate(keys, entries, ctx)──>┘
//!                     <── BulkOutcome { key -> Stored(version) | Failed }
//! ```
//!
//! [`MemoryCache`] is the in-process implementation used by the server binary
//! and the benchmarks.

pub mod engine;
pub mod expiry;
#[cfg(test)]
pub mod testing;

use crate::session::ClientDescriptor;
use bytes::Bytes;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use engine::{MemoryCache, MemoryCacheConfig, MemoryCatalog};
pub use expiry::{start_expiry_sweeper, ExpiryConfig, ExpirySweeper};

/// Opaque per-item version token returned by the store.
pub type Version = u64;

/// Expiration attached to one entry. Times are in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Expiration {
    /// Expire this long after the write
    pub absolute_ms: Option<u64>,
    /// Expire after this long without access
    pub sliding_ms: Option<u64>,
}

impl Expiration {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn absolute(ms: u64) -> Self {
        Self {
            absolute_ms: Some(ms),
            sliding_ms: None,
        }
    }

    pub fn sliding(ms: u64) -> Self {
        Self {
            absolute_ms: None,
            sliding_ms: Some(ms),
        }
    }
}

impl fmt::Display for Expiration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let absolute = self.absolute_ms.map_or(-1, |v| v as i64);
        let sliding = self.sliding_ms.map_or(-1, |v| v as i64);
        write!(f, "absolute={}ms sliding={}ms", absolute, sliding)
    }
}

/// One value to be written, with its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: Bytes,
    pub expiration: Expiration,
    pub priority: i64,
    pub tags: Vec<String>,
}

impl CacheEntry {
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            value: value.into(),
            expiration: Expiration::none(),
            priority: 0,
            tags: Vec::new(),
        }
    }

    pub fn with_expiration(mut self, expiration: Expiration) -> Self {
        self.expiration = expiration;
        self
    }
}

/// Which bulk mutation is being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    /// Fails keys that already exist
    Add,
    /// Overwrites existing keys
    Insert,
}

impl MutationKind {
    pub fn method_name(self) -> &'static str {
        match self {
            MutationKind::Add => "addbulk",
            MutationKind::Insert => "insertbulk",
        }
    }
}

/// Durability flags carried by a mutation request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutationFlags(u32);

impl MutationFlags {
    pub const WRITE_THRU: u32 = 0x01;
    pub const WRITE_BEHIND: u32 = 0x02;

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_set(self, bit: u32) -> bool {
        self.0 & bit == bit
    }

    pub fn write_thru(self) -> bool {
        self.is_set(Self::WRITE_THRU)
    }

    pub fn write_behind(self) -> bool {
        self.is_set(Self::WRITE_BEHIND)
    }
}

/// Per-call settings passed to the store. Built once per command and
/// dropped when the store call returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    pub operation: MutationKind,
    pub raise_notification: bool,
    pub client_last_view_id: i64,
    pub write_thru: bool,
    pub write_behind: bool,
    pub intended_recipient: Option<String>,
}

/// Why a single key was not stored.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyFailure {
    #[error("the specified key already exists")]
    AlreadyExists,

    #[error("the operation on this key was rejected: {0}")]
    Rejected(String),

    #[error("the key is locked by another client")]
    Locked,
}

/// Result for one key of a bulk call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOutcome {
    Stored { version: Version },
    Failed(KeyFailure),
}

impl KeyOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, KeyOutcome::Stored { .. })
    }
}

/// What a bulk call produced, one entry per submitted key, in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub results: Vec<(Bytes, KeyOutcome)>,
}

impl BulkOutcome {
    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|(_, o)| !o.is_stored()).count()
    }
}

/// A cluster node that is shutting down gracefully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainingServer {
    pub address: IpAddr,
    pub port: u16,
    /// Identifies this drain window; clients hold writes for this node under it
    pub blocking_id: String,
    pub timeout: Duration,
}

/// Errors that fail a whole store call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("cache '{0}' is not registered on this server")]
    CacheNotFound(String),

    #[error("cache '{0}' is not running")]
    CacheNotRunning(String),

    #[error("no backing data source is configured for write-through or write-behind")]
    NoDataSource,

    #[error("store failure: {0}")]
    Internal(String),
}

/// Everything the catalog needs to hand out a cache.
#[derive(Debug, Clone)]
pub struct CacheOpenRequest<'a> {
    pub cache_id: &'a str,
    pub licence: &'a str,
    pub client: &'a ClientDescriptor,
    pub is_dotnet_client: bool,
}

/// The cache as seen by the command layer.
///
/// Implementations must be safe to call from many connection tasks at once.
/// Calls are blocking from the caller's point of view; timeouts belong to
/// the implementation.
pub trait CacheStore: Send + Sync {
    fn cache_id(&self) -> &str;

    /// Topology/type tag (for example `local`, `replicated`, `partitioned`).
    fn cache_type(&self) -> &str;

    fn is_persistence_enabled(&self) -> bool;

    fn persistence_interval(&self) -> Duration;

    /// Nodes currently draining; empty when no graceful shutdown is in progress.
    fn shutdown_servers(&self) -> Vec<DrainingServer>;

    /// Writes `keys[i] = entries[i]` for every `i` as one call.
    ///
    /// Returns `Err` only when nothing was attempted; once keys have been
    /// processed every failure is reported per key.
    fn bulk_mutate(
        &self,
        keys: &[Bytes],
        entries: &[CacheEntry],
        flags: MutationFlags,
        provider: Option<&str>,
        context: &OperationContext,
    ) -> Result<BulkOutcome, StoreError>;

    /// A client session ended because the client went away.
    fn client_disconnected(&self, client_id: &str);
}

/// Resolves a cache identity to a running cache.
pub trait CacheCatalog: Send + Sync {
    fn open(&self, request: &CacheOpenRequest<'_>) -> Result<Arc<dyn CacheStore>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let flags = MutationFlags::from_bits(MutationFlags::WRITE_THRU);
        assert!(flags.write_thru());
        assert!(!flags.write_behind());

        let both = MutationFlags::from_bits(MutationFlags::WRITE_THRU | MutationFlags::WRITE_BEHIND);
        assert!(both.write_thru() && both.write_behind());
        assert_eq!(MutationFlags::default().bits(), 0);
    }

    #[test]
    fn test_expiration_display() {
        assert_eq!(
            Expiration::absolute(500).to_string(),
            "absolute=500ms sliding=-1ms"
        );
        assert_eq!(Expiration::none().to_string(), "absolute=-1ms sliding=-1ms");
    }

    #[test]
    fn test_failed_count() {
        let outcome = BulkOutcome {
            results: vec![
                (Bytes::from("a"), KeyOutcome::Stored { version: 1 }),
                (Bytes::from("b"), KeyOutcome::Failed(KeyFailure::Locked)),
            ],
        };
        assert_eq!(outcome.failed_count(), 1);
    }
}
