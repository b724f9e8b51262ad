//! Scripted store used by the command and session tests.

use crate::storage::{
    BulkOutcome, CacheCatalog, CacheEntry, CacheOpenRequest, CacheStore, DrainingServer,
    KeyFailure, KeyOutcome, MutationFlags, OperationContext, StoreError,
};
use crate::session::ClientDescriptor;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// One recorded `bulk_mutate` call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub keys: Vec<Bytes>,
    pub entries: Vec<CacheEntry>,
    pub flags: MutationFlags,
    pub provider: Option<String>,
    pub context: OperationContext,
}

#[derive(Debug, Default)]
pub struct ScriptedStore {
    failing_keys: Mutex<HashSet<Bytes>>,
    batch_error: Mutex<Option<StoreError>>,
    draining: Mutex<Vec<DrainingServer>>,
    calls: Mutex<Vec<RecordedCall>>,
    disconnected: Mutex<Vec<String>>,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `key` fail with [`KeyFailure::Rejected`] on every call.
    pub fn fail_key(&self, key: &str) {
        self.failing_keys
            .lock()
            .insert(Bytes::copy_from_slice(key.as_bytes()));
    }

    pub fn fail_batch(&self, error: StoreError) {
        *self.batch_error.lock() = Some(error);
    }

    pub fn set_draining(&self, servers: Vec<DrainingServer>) {
        *self.draining.lock() = servers;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn disconnected(&self) -> Vec<String> {
        self.disconnected.lock().clone()
    }
}

impl CacheStore for ScriptedStore {
    fn cache_id(&self) -> &str {
        "scripted"
    }

    fn cache_type(&self) -> &str {
        "Partitioned"
    }

    fn is_persistence_enabled(&self) -> bool {
        true
    }

    fn persistence_interval(&self) -> Duration {
        Duration::from_secs(30)
    }

    fn shutdown_servers(&self) -> Vec<DrainingServer> {
        self.draining.lock().clone()
    }

    fn bulk_mutate(
        &self,
        keys: &[Bytes],
        entries: &[CacheEntry],
        flags: MutationFlags,
        provider: Option<&str>,
        context: &OperationContext,
    ) -> Result<BulkOutcome, StoreError> {
        self.calls.lock().push(RecordedCall {
            keys: keys.to_vec(),
            entries: entries.to_vec(),
            flags,
            provider: provider.map(str::to_string),
            context: context.clone(),
        });

        if let Some(error) = self.batch_error.lock().clone() {
            return Err(error);
        }

        let failing = self.failing_keys.lock();
        let results = keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let outcome = if failing.contains(key) {
                    KeyOutcome::Failed(KeyFailure::Rejected("scripted".to_string()))
                } else {
                    KeyOutcome::Stored {
                        version: 100 + i as u64,
                    }
                };
                (key.clone(), outcome)
            })
            .collect();
        Ok(BulkOutcome { results })
    }

    fn client_disconnected(&self, client_id: &str) {
        self.disconnected.lock().push(client_id.to_string());
    }
}

/// Catalog that hands out one scripted store and remembers what it was asked.
#[derive(Debug, Default)]
pub struct ScriptedCatalog {
    pub store: Arc<ScriptedStore>,
    opened: Mutex<Vec<(String, String, ClientDescriptor)>>,
    unavailable: Mutex<bool>,
}

impl ScriptedCatalog {
    pub fn new(store: Arc<ScriptedStore>) -> Self {
        Self {
            store,
            opened: Mutex::new(Vec::new()),
            unavailable: Mutex::new(false),
        }
    }

    pub fn make_unavailable(&self) {
        *self.unavailable.lock() = true;
    }

    /// `(cache_id, licence, descriptor)` for every successful open.
    pub fn opened(&self) -> Vec<(String, String, ClientDescriptor)> {
        self.opened.lock().clone()
    }
}

impl CacheCatalog for ScriptedCatalog {
    fn open(&self, request: &CacheOpenRequest<'_>) -> Result<Arc<dyn CacheStore>, StoreError> {
        if *self.unavailable.lock() {
            return Err(StoreError::CacheNotRunning(request.cache_id.to_string()));
        }
        self.opened.lock().push((
            request.cache_id.to_string(),
            request.licence.to_string(),
            request.client.clone(),
        ));
        Ok(Arc::clone(&self.store) as Arc<dyn CacheStore>)
    }
}
