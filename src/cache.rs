//! TTL-bounded session cache.
//!
//! Expiry is evaluated lazily at lookup and insertion time; there is no
//! background sweeper. Capacity pressure first drops expired entries, then
//! the oldest live one.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::lock_mutex;
use crate::session::TransportSession;

/// Concurrent map from a caller-chosen key to a live session.
pub struct SessionCache<K> {
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<K, Arc<TransportSession>>>,
}

impl<K: Eq + Hash + Clone> SessionCache<K> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the live session for `key`, dropping it if expired.
    pub fn lookup(&self, key: &K) -> Option<Arc<TransportSession>> {
        let mut entries = lock_mutex(&self.entries);
        match entries.get(key) {
            Some(session) if !session.is_expired(self.ttl) => Some(Arc::clone(session)),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Inserts a session, replacing any existing entry for `key`.
    ///
    /// Concurrent handshakes to the same destination can race here; the last
    /// writer wins and the displaced session simply drains as its holders
    /// finish with it.
    pub fn insert(&self, key: K, session: Arc<TransportSession>) {
        let mut entries = lock_mutex(&self.entries);
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            entries.retain(|_, session| !session.is_expired(self.ttl));
            if entries.len() >= self.capacity {
                // Still full of live sessions: evict the oldest.
                let oldest = entries
                    .iter()
                    .max_by_key(|(_, session)| session.age())
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    debug!("session cache full, evicting oldest entry");
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(key, session);
    }

    /// Removes the entry for `key` only if it still holds `session`.
    ///
    /// The pointer-identity guard keeps a failed exchange on a stale session
    /// from evicting a fresh replacement another task just negotiated.
    pub fn remove_if(&self, key: &K, session: &Arc<TransportSession>) {
        let mut entries = lock_mutex(&self.entries);
        if let Some(current) = entries.get(key) {
            if Arc::ptr_eq(current, session) {
                entries.remove(key);
            }
        }
    }

    /// Drops every cached session.
    pub fn flush(&self) {
        lock_mutex(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock_mutex(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
