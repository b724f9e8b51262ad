//! Session Registry
//!
//! Maps client identity to the live [`Session`] holding it. The registry is
//! injected into whatever needs it; there is no process-wide table.
//!
//! Writers (`register`, `unregister`) take the write lock for one map
//! operation. A session evicted by `register` is marked replaced before that
//! lock is released, so a concurrent teardown of it that finds its entry gone
//! always sees the flag. Readers take the read lock and therefore see either the old
//! session or the new one, never a gap between remove and insert. Evicted
//! sessions are handed back to the caller so their disposal happens after
//! the lock is released.

use crate::session::Session;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `session` under `identity`.
    ///
    /// A session already holding the identity is removed, marked replaced and
    /// returned. The caller owns its disposal.
    pub fn register(&self, identity: &str, session: Arc<Session>) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let evicted = sessions.insert(identity.to_string(), session);
        if let Some(previous) = &evicted {
            previous.mark_replaced();
        }
        drop(sessions);
        evicted
    }

    /// Removes whatever session holds `identity`. No-op if absent.
    pub fn unregister(&self, identity: &str) -> Option<Arc<Session>> {
        self.sessions.write().remove(identity)
    }

    /// Removes the entry only if it still points at `session`.
    ///
    /// A connection closing after its session was replaced must not remove
    /// the successor.
    pub fn unregister_if(&self, identity: &str, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(identity) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(identity);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, identity: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(identity).cloned()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.sessions.read().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the identities currently registered.
    pub fn identities(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }
}
