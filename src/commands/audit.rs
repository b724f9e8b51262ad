//! API audit log collaborator.
//!
//! Handlers describe what they did as an [`AuditEntry`]; the command driver
//! hands it to an [`AuditSink`] after the response has been built. A sink
//! failure is counted and dropped. It never changes the response.

use crate::storage::Expiration;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuditError {
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),

    #[error("audit entry rejected: {0}")]
    Rejected(String),
}

/// One audited bulk mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    /// `addbulk` or `insertbulk`
    pub method: &'static str,
    pub key_count: usize,
    pub value_count: usize,
    /// Expiration of the first entry in the batch
    pub expiration: Expiration,
    pub priority: i64,
    pub tags: Vec<String>,
    pub group: Option<String>,
    pub subgroup: Option<String>,
    pub provider: Option<String>,
    pub resync_provider: Option<String>,
    pub method_overload: i64,
    pub update_callback_id: i64,
    pub ds_added_callback_id: i64,
    /// Failure text when the call failed as a whole
    pub exception: Option<String>,
    pub elapsed: Duration,
    pub client_id: String,
    pub client_address: SocketAddr,
}

/// Destination for audit entries.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError>;
}

/// Writes entries as structured `tracing` events under the `flashgate::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        info!(
            target: "flashgate::audit",
            method = entry.method,
            keys = entry.key_count,
            values = entry.value_count,
            expiration = %entry.expiration,
            priority = entry.priority,
            tags = ?entry.tags,
            group = ?entry.group,
            subgroup = ?entry.subgroup,
            provider = ?entry.provider,
            resync_provider = ?entry.resync_provider,
            overload = entry.method_overload,
            update_callback = entry.update_callback_id,
            ds_added_callback = entry.ds_added_callback_id,
            exception = ?entry.exception,
            elapsed_us = entry.elapsed.as_micros() as u64,
            client_id = %entry.client_id,
            client = %entry.client_address,
            "API call"
        );
        Ok(())
    }
}
