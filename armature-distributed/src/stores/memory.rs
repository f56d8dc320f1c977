//! In-memory lock store
//!
//! Uses DashMap for thread-safe concurrent access; each operation runs under
//! the shard lock of its key, which makes it atomic per key. Suitable for
//! single-instance deployments or testing. For distributed deployments, use
//! the Redis store.

use crate::error::LockResult;
use crate::record::{millis, now_millis};
use crate::stores::LockStore;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct StoredLock {
    token: String,
    /// Wall-clock milliseconds; the entry is gone once this is reached.
    expires_at: i64,
}

impl StoredLock {
    fn is_live(&self, now: i64) -> bool {
        self.expires_at > now
    }
}

/// In-memory lock store with lazy expiry.
pub struct MemoryLockStore {
    entries: DashMap<String, StoredLock>,
}

impl MemoryLockStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        debug!("Creating new in-memory lock store");
        Self {
            entries: DashMap::new(),
        }
    }

    /// Current holder token of `key`, if the lock is live.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = now_millis();
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.token.clone())
    }

    /// Remaining lease of `key`, if the lock is live.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = now_millis();
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| Duration::from_millis((entry.expires_at - now) as u64))
    }

    /// Number of live locks.
    pub fn len(&self) -> usize {
        let now = now_millis();
        self.entries.iter().filter(|entry| entry.is_live(now)).count()
    }

    /// Whether no live lock is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        let purged = before.saturating_sub(self.entries.len());
        debug!(purged = purged, "Purged expired locks");
        purged
    }
}

impl Default for MemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn acquire(&self, key: &str, token: &str, lease: Duration) -> LockResult<bool> {
        let now = now_millis();
        let fresh = StoredLock {
            token: token.to_string(),
            expires_at: now.saturating_add(millis(lease)),
        };

        let acquired = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.is_live(now) && current.token != token {
                    false
                } else {
                    // Expired, or a repeat of an attempt that already landed
                    occupied.insert(fresh);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
        };

        trace!(key = %key, acquired = acquired, "Memory acquire");
        Ok(acquired)
    }

    async fn release(&self, key: &str, token: &str) -> LockResult<bool> {
        let now = now_millis();
        // Expired entries go regardless of token; only a live match counts
        let released = self
            .entries
            .remove_if(key, |_, entry| !entry.is_live(now) || entry.token == token)
            .is_some_and(|(_, entry)| entry.is_live(now) && entry.token == token);

        trace!(key = %key, released = released, "Memory release");
        Ok(released)
    }

    async fn renew(&self, key: &str, token: &str, expires_at_ms: i64) -> LockResult<bool> {
        let now = now_millis();
        let renewed = match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) && entry.token == token => {
                entry.expires_at = expires_at_ms;
                true
            }
            _ => false,
        };

        trace!(key = %key, renewed = renewed, "Memory renew");
        Ok(renewed)
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}
