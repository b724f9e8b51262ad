//! Per-command statistics.
//!
//! Counters are plain atomics updated with `Relaxed` ordering; readers get a
//! consistent-enough view for monitoring, not a snapshot.

use crate::commands::CommandKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct KindCounter {
    count: AtomicU64,
    total_micros: AtomicU64,
}

/// Shared counter sink for every command handler.
#[derive(Debug, Default)]
pub struct CommandStats {
    kinds: [KindCounter; CommandKind::COUNT],
    audit_failures: AtomicU64,
}

impl CommandStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one execution of `kind` that took `elapsed`.
    pub fn record(&self, kind: CommandKind, elapsed: Duration) {
        let counter = &self.kinds[kind.index()];
        counter.count.fetch_add(1, Ordering::Relaxed);
        counter.total_micros.fetch_add(
            u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }

    pub fn count(&self, kind: CommandKind) -> u64 {
        self.kinds[kind.index()].count.load(Ordering::Relaxed)
    }

    pub fn total_micros(&self, kind: CommandKind) -> u64 {
        self.kinds[kind.index()].total_micros.load(Ordering::Relaxed)
    }

    /// Mean execution time, or 0 when the command never ran.
    pub fn average_micros(&self, kind: CommandKind) -> u64 {
        match self.count(kind) {
            0 => 0,
            n => self.total_micros(kind) / n,
        }
    }

    pub fn record_audit_failure(&self) {
        self.audit_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Audit writes that failed and were dropped.
    pub fn audit_failures(&self) -> u64 {
        self.audit_failures.load(Ordering::Relaxed)
    }
}
