//! Background Expiry Sweeper
//!
//! [`MemoryCache`] drops expired items lazily when they are read. Items that
//! are never read again would otherwise stay resident, so a Tokio task
//! periodically calls [`MemoryCache::cleanup_expired`].
//!
//! The sweep interval adapts: it halves while a large fraction of items is
//! expiring and doubles while nothing is, bounded by `min_interval` and
//! `max_interval`.

use crate::storage::MemoryCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace};

/// Tuning for the sweeper.
#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    pub base_interval: Duration,
    pub min_interval: Duration,
    pub max_interval: Duration,

    /// Expired fraction above which sweeping speeds up
    pub speedup_threshold: f64,

    /// Expired fraction below which sweeping slows down
    pub slowdown_threshold: f64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(250),
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(2),
            speedup_threshold: 0.25,
            slowdown_threshold: 0.01,
        }
    }
}

/// Handle to a running sweeper. Dropping it stops the task.
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    /// Spawns the sweeper onto the current runtime.
    pub fn start(cache: Arc<MemoryCache>, config: ExpiryConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(sweep(cache, config, shutdown_rx));
        info!("Expiry sweeper started");
        Self { shutdown_tx }
    }

    pub fn stop(&self) {
        if !self.shutdown_tx.send_replace(true) {
            debug!("Expiry sweeper stopped");
        }
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweep(
    cache: Arc<MemoryCache>,
    config: ExpiryConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut interval = config.base_interval;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
        }

        let before = cache.len();
        let expired = cache.cleanup_expired();

        if before > 0 {
            let rate = expired as f64 / before as f64;
            if rate > config.speedup_threshold {
                interval = (interval / 2).max(config.min_interval);
                trace!(
                    expired,
                    interval_ms = interval.as_millis() as u64,
                    "Sweeper speeding up"
                );
            } else if rate < config.slowdown_threshold && expired == 0 {
                interval = (interval * 2).min(config.max_interval);
            }
        }

        if expired > 0 {
            debug!(
                cache_id = %crate::storage::CacheStore::cache_id(cache.as_ref()),
                expired,
                remaining = cache.len(),
                "Expired items removed"
            );
        }
    }
}

/// Starts a sweeper with [`ExpiryConfig::default`].
pub fn start_expiry_sweeper(cache: Arc<MemoryCache>) -> ExpirySweeper {
    ExpirySweeper::start(cache, ExpiryConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{
        CacheEntry, CacheStore, Expiration, MemoryCacheConfig, MutationFlags, MutationKind,
        OperationContext,
    };
    use bytes::Bytes;

    fn seed(cache: &MemoryCache, prefix: &str, count: usize, expiration: Expiration) {
        let keys: Vec<Bytes> = (0..count)
            .map(|i| Bytes::from(format!("{}{}", prefix, i)))
            .collect();
        let entries: Vec<CacheEntry> = (0..count)
            .map(|_| CacheEntry::new(Bytes::from("v")).with_expiration(expiration))
            .collect();
        let context = OperationContext {
            operation: MutationKind::Insert,
            raise_notification: false,
            client_last_view_id: -1,
            write_thru: false,
            write_behind: false,
            intended_recipient: None,
        };
        cache
            .bulk_mutate(&keys, &entries, MutationFlags::default(), None, &context)
            .unwrap();
    }

    fn fast() -> ExpiryConfig {
        ExpiryConfig {
            base_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_items() {
        let cache = Arc::new(MemoryCache::new(MemoryCacheConfig::default()));
        seed(&cache, "short", 10, Expiration::absolute(30));
        seed(&cache, "keep", 1, Expiration::none());
        assert_eq!(cache.len(), 11);

        let _sweeper = ExpirySweeper::start(Arc::clone(&cache), fast());
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(cache.len(), 1);
        assert!(cache.get(b"keep0").is_some());
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_drop() {
        let cache = Arc::new(MemoryCache::new(MemoryCacheConfig::default()));
        {
            let _sweeper = ExpirySweeper::start(Arc::clone(&cache), fast());
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        seed(&cache, "late", 5, Expiration::absolute(10));
        tokio::time::sleep(Duration::from_millis(80)).await;

        // Nothing swept them; they are still counted until touched.
        assert_eq!(cache.len(), 5);
        assert!(cache.get(b"late0").is_none());
        assert_eq!(cache.len(), 4);
    }
}
