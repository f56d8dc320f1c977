//! Process-wide registry of held locks.
//!
//! Records are reachable by key and, for the watchdog, in ascending expiry
//! order. Both views sit behind one mutex and change together.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use tracing::trace;

use crate::record::LockRecord;
use crate::token::LockToken;

#[derive(Default)]
struct Inner {
    by_key: HashMap<String, LockRecord>,
    by_expiry: BTreeSet<(i64, String)>,
}

impl Inner {
    fn unlink(&mut self, key: &str) -> Option<LockRecord> {
        let record = self.by_key.remove(key)?;
        self.by_expiry.remove(&(record.expires_at, record.key.clone()));
        Some(record)
    }

    fn link(&mut self, record: LockRecord) {
        self.by_expiry.insert((record.expires_at, record.key.clone()));
        self.by_key.insert(record.key.clone(), record);
    }
}

/// Map of key to [`LockRecord`] plus an expiry-ordered index.
#[derive(Default)]
pub(crate) struct LockRegistry {
    inner: Mutex<Inner>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, replacing any previous record for the same key.
    pub fn insert(&self, record: LockRecord) -> Option<LockRecord> {
        let mut inner = self.inner.lock();
        let previous = inner.unlink(&record.key);
        trace!(key = %record.key, expires_at = record.expires_at, "registry insert");
        inner.link(record);
        previous
    }

    pub fn get(&self, key: &str) -> Option<LockRecord> {
        self.inner.lock().by_key.get(key).cloned()
    }

    /// Remove the record for `key` only if it still carries `token`.
    ///
    /// A newer holder's record is left untouched.
    pub fn remove(&self, key: &str, token: &LockToken) -> Option<LockRecord> {
        let mut inner = self.inner.lock();
        if !inner.by_key.get(key).is_some_and(|r| &r.token == token) {
            return None;
        }
        trace!(key = %key, "registry remove");
        inner.unlink(key)
    }

    /// Move the record for `key` to a new expiry if it still carries `token`.
    pub fn update_expiry(&self, key: &str, token: &LockToken, expires_at: i64) -> bool {
        let mut inner = self.inner.lock();
        if !inner.by_key.get(key).is_some_and(|r| &r.token == token) {
            return false;
        }
        if let Some(mut record) = inner.unlink(key) {
            record.expires_at = expires_at;
            inner.link(record);
        }
        true
    }

    /// Records expiring before `horizon`, earliest first.
    ///
    /// Stops at the first record at or past the horizon, so the cost is
    /// proportional to the number of near-due records.
    pub fn due_before(&self, horizon: i64) -> Vec<LockRecord> {
        let inner = self.inner.lock();
        inner
            .by_expiry
            .iter()
            .take_while(|(expires_at, _)| *expires_at < horizon)
            .filter_map(|(_, key)| inner.by_key.get(key).cloned())
            .collect()
    }

    /// All records, earliest expiry first.
    pub fn snapshot(&self) -> Vec<LockRecord> {
        let inner = self.inner.lock();
        inner
            .by_expiry
            .iter()
            .filter_map(|(_, key)| inner.by_key.get(key).cloned())
            .collect()
    }

    /// Remove and return every record.
    pub fn drain(&self) -> Vec<LockRecord> {
        let mut inner = self.inner.lock();
        inner.by_expiry.clear();
        inner.by_key.drain().map(|(_, record)| record).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_key.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Liveness, OwnerHandle};
    use std::sync::Arc;

    fn record(key: &str, token: &str, expires_at: i64, owner: &Arc<Liveness>) -> LockRecord {
        LockRecord {
            key: key.to_string(),
            token: LockToken::from(token),
            expires_at,
            renewable: true,
            owner: OwnerHandle::of(owner),
        }
    }

    fn keys(records: &[LockRecord]) -> Vec<&str> {
        records.iter().map(|r| r.key.as_str()).collect()
    }

    #[test]
    fn test_snapshot_is_expiry_ordered() {
        let owner = Liveness::new();
        let registry = LockRegistry::new();
        registry.insert(record("c", "t", 300, &owner));
        registry.insert(record("a", "t", 100, &owner));
        registry.insert(record("b", "t", 200, &owner));

        assert_eq!(keys(&registry.snapshot()), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_insert_replaces_same_key() {
        let owner = Liveness::new();
        let registry = LockRegistry::new();
        registry.insert(record("job", "old", 100, &owner));
        let previous = registry.insert(record("job", "new", 500, &owner));

        assert_eq!(previous.unwrap().token.as_str(), "old");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot().len(), 1);
        assert_eq!(registry.get("job").unwrap().token.as_str(), "new");
    }

    #[test]
    fn test_remove_requires_matching_token() {
        let owner = Liveness::new();
        let registry = LockRegistry::new();
        registry.insert(record("job", "t1", 100, &owner));

        assert!(registry.remove("job", &LockToken::from("t2")).is_none());
        assert!(registry.get("job").is_some());

        assert!(registry.remove("job", &LockToken::from("t1")).is_some());
        assert!(registry.is_empty());
        assert!(registry.due_before(i64::MAX).is_empty());
    }

    #[test]
    fn test_update_expiry_reorders() {
        let owner = Liveness::new();
        let registry = LockRegistry::new();
        registry.insert(record("a", "ta", 100, &owner));
        registry.insert(record("b", "tb", 200, &owner));

        assert!(registry.update_expiry("a", &LockToken::from("ta"), 300));
        assert!(!registry.update_expiry("b", &LockToken::from("wrong"), 50));

        assert_eq!(keys(&registry.snapshot()), vec!["b", "a"]);
        assert_eq!(registry.get("a").unwrap().expires_at, 300);
        assert_eq!(registry.get("b").unwrap().expires_at, 200);
    }

    #[test]
    fn test_due_before_stops_at_horizon() {
        let owner = Liveness::new();
        let registry = LockRegistry::new();
        registry.insert(record("a", "t", 100, &owner));
        registry.insert(record("b", "t", 200, &owner));
        registry.insert(record("c", "t", 300, &owner));

        assert_eq!(keys(&registry.due_before(200)), vec!["a"]);
        assert_eq!(keys(&registry.due_before(301)), vec!["a", "b", "c"]);
        assert!(registry.due_before(100).is_empty());
    }

    #[test]
    fn test_drain() {
        let owner = Liveness::new();
        let registry = LockRegistry::new();
        registry.insert(record("a", "t", 100, &owner));
        registry.insert(record("b", "t", 200, &owner));

        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
        assert!(registry.snapshot().is_empty());
    }
}
