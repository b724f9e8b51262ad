//! In-Memory Cache
//!
//! A sharded, versioned key-value store implementing [`CacheStore`]. It is
//! what the server binary serves when no external cache is plugged in.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       MemoryCache                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! │        version counter · drain list · EventHub             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every successful write gets a fresh version from one counter. Expired
//! items are removed lazily on access and by the [`ExpirySweeper`].
//!
//! [`ExpirySweeper`]: crate::storage::ExpirySweeper

use crate::session::{CacheEvent, EventHub};
use crate::storage::{
    BulkOutcome, CacheCatalog, CacheEntry, CacheOpenRequest, CacheStore, DrainingServer,
    KeyFailure, KeyOutcome, MutationFlags, MutationKind, OperationContext, StoreError, Version,
};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Number of shards.
const NUM_SHARDS: usize = 64;

/// A stored item.
#[derive(Debug, Clone)]
struct Item {
    value: Bytes,
    version: Version,
    expires_at: Option<Instant>,
    sliding: Option<Duration>,
}

impl Item {
    fn from_entry(entry: &CacheEntry, version: Version) -> Self {
        let now = Instant::now();
        let sliding = entry.expiration.sliding_ms.map(Duration::from_millis);
        let expires_at = match (entry.expiration.absolute_ms, sliding) {
            (Some(ms), _) => Some(now + Duration::from_millis(ms)),
            (None, Some(window)) => Some(now + window),
            (None, None) => None,
        };
        Self {
            value: entry.value.clone(),
            version,
            expires_at,
            sliding,
        }
    }

    #[inline]
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    fn touch(&mut self, now: Instant) {
        if let Some(window) = self.sliding {
            self.expires_at = Some(now + window);
        }
    }
}

/// Static properties of a cache instance.
#[derive(Debug, Clone)]
pub struct MemoryCacheConfig {
    pub cache_id: String,
    pub cache_type: String,
    pub persistence_enabled: bool,
    pub persistence_interval: Duration,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            cache_id: "default".to_string(),
            cache_type: "Local".to_string(),
            persistence_enabled: false,
            persistence_interval: Duration::ZERO,
        }
    }
}

/// The in-memory [`CacheStore`].
pub struct MemoryCache {
    config: MemoryCacheConfig,
    shards: Vec<RwLock<HashMap<Bytes, Item>>>,
    next_version: AtomicU64,
    key_count: AtomicU64,
    draining: Mutex<Vec<DrainingServer>>,
    events: Option<Arc<EventHub>>,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("cache_id", &self.config.cache_id)
            .field("shards", &self.shards.len())
            .field("keys", &self.len())
            .finish()
    }
}

impl MemoryCache {
    pub fn new(config: MemoryCacheConfig) -> Self {
        Self {
            config,
            shards: (0..NUM_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            next_version: AtomicU64::new(0),
            key_count: AtomicU64::new(0),
            draining: Mutex::new(Vec::new()),
            events: None,
        }
    }

    /// Publishes item events to `hub` for writes that ask for notification.
    pub fn with_events(mut self, hub: Arc<EventHub>) -> Self {
        self.events = Some(hub);
        self
    }

    #[inline]
    fn shard(&self, key: &[u8]) -> &RwLock<HashMap<Bytes, Item>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % NUM_SHARDS]
    }

    fn version(&self) -> Version {
        self.next_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Reads a value, refreshing sliding expiration.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let now = Instant::now();
        let mut shard = self.shard(key).write();
        match shard.get_mut(key) {
            Some(item) if item.is_expired(now) => {
                shard.remove(key);
                self.key_count.fetch_sub(1, Ordering::Relaxed);
                None
            }
            Some(item) => {
                item.touch(now);
                Some(item.value.clone())
            }
            None => None,
        }
    }

    /// Version of a live item.
    pub fn version_of(&self, key: &[u8]) -> Option<Version> {
        let now = Instant::now();
        self.shard(key)
            .read()
            .get(key)
            .filter(|item| !item.is_expired(now))
            .map(|item| item.version)
    }

    pub fn len(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes expired items from every shard. Returns how many were removed.
    pub fn cleanup_expired(&self) -> u64 {
        let now = Instant::now();
        let mut cleaned = 0u64;
        for shard in &self.shards {
            let mut data = shard.write();
            let before = data.len();
            data.retain(|_, item| !item.is_expired(now));
            cleaned += (before - data.len()) as u64;
        }
        if cleaned > 0 {
            self.key_count.fetch_sub(cleaned, Ordering::Relaxed);
        }
        cleaned
    }

    /// Announces that a node is draining; clients learn about it on handshake.
    pub fn begin_node_drain(&self, server: DrainingServer) {
        info!(
            address = %server.address,
            port = server.port,
            blocking_id = %server.blocking_id,
            "Node drain started"
        );
        let mut draining = self.draining.lock();
        draining.retain(|s| !(s.address == server.address && s.port == server.port));
        draining.push(server);
    }

    /// Ends the drain window identified by `blocking_id`.
    pub fn end_node_drain(&self, blocking_id: &str) -> bool {
        let mut draining = self.draining.lock();
        let before = draining.len();
        draining.retain(|s| s.blocking_id != blocking_id);
        draining.len() != before
    }

    fn write_one(&self, kind: MutationKind, key: &Bytes, entry: &CacheEntry) -> (KeyOutcome, bool) {
        let now = Instant::now();
        let mut shard = self.shard(key).write();
        let existed = shard.get(key).is_some_and(|item| !item.is_expired(now));

        if existed && kind == MutationKind::Add {
            return (KeyOutcome::Failed(KeyFailure::AlreadyExists), true);
        }

        let version = self.version();
        let replaced = shard.insert(key.clone(), Item::from_entry(entry, version));
        if replaced.is_none() {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }
        (KeyOutcome::Stored { version }, existed)
    }
}

impl CacheStore for MemoryCache {
    fn cache_id(&self) -> &str {
        &self.config.cache_id
    }

    fn cache_type(&self) -> &str {
        &self.config.cache_type
    }

    fn is_persistence_enabled(&self) -> bool {
        self.config.persistence_enabled
    }

    fn persistence_interval(&self) -> Duration {
        self.config.persistence_interval
    }

    fn shutdown_servers(&self) -> Vec<DrainingServer> {
        self.draining.lock().clone()
    }

    fn bulk_mutate(
        &self,
        keys: &[Bytes],
        entries: &[CacheEntry],
        flags: MutationFlags,
        _provider: Option<&str>,
        context: &OperationContext,
    ) -> Result<BulkOutcome, StoreError> {
        if keys.len() != entries.len() {
            return Err(StoreError::Internal(format!(
                "{} keys but {} entries",
                keys.len(),
                entries.len()
            )));
        }
        // There is no backing data source behind an in-memory cache.
        if flags.write_thru() || flags.write_behind() || context.write_thru || context.write_behind
        {
            return Err(StoreError::NoDataSource);
        }

        let mut results = Vec::with_capacity(keys.len());
        for (key, entry) in keys.iter().zip(entries) {
            let (outcome, existed) = self.write_one(context.operation, key, entry);
            if let (true, Some(hub), KeyOutcome::Stored { .. }) =
                (context.raise_notification, &self.events, &outcome)
            {
                let key = key.clone();
                hub.publish(if existed {
                    CacheEvent::ItemUpdated { key }
                } else {
                    CacheEvent::ItemAdded { key }
                });
            }
            results.push((key.clone(), outcome));
        }

        Ok(BulkOutcome { results })
    }

    fn client_disconnected(&self, client_id: &str) {
        debug!(cache_id = %self.config.cache_id, client_id = %client_id, "Client left cache");
    }
}

/// Catalog over a fixed set of in-memory caches.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    caches: RwLock<HashMap<String, Arc<MemoryCache>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, cache: Arc<MemoryCache>) {
        self.caches
            .write()
            .insert(cache.cache_id().to_string(), cache);
    }

    pub fn get(&self, cache_id: &str) -> Option<Arc<MemoryCache>> {
        self.caches.read().get(cache_id).cloned()
    }
}

impl CacheCatalog for MemoryCatalog {
    fn open(&self, request: &CacheOpenRequest<'_>) -> Result<Arc<dyn CacheStore>, StoreError> {
        self.get(request.cache_id)
            .map(|cache| cache as Arc<dyn CacheStore>)
            .ok_or_else(|| StoreError::CacheNotFound(request.cache_id.to_string()))
    }
}
