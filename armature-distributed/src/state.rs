//! Per-context bookkeeping of held locks and their reentry counts.

use std::collections::HashMap;

use crate::token::LockToken;

#[derive(Debug, Clone)]
struct HeldLock {
    token: LockToken,
    count: u32,
}

/// Locks a single [`LockContext`](crate::LockContext) currently holds.
///
/// Never shared between contexts, so no synchronization.
#[derive(Debug, Default)]
pub(crate) struct ContextLockState {
    held: HashMap<String, HeldLock>,
}

impl ContextLockState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self, key: &str) -> Option<LockToken> {
        self.held.get(key).map(|held| held.token.clone())
    }

    /// Current reentry count, `0` when not held.
    pub fn count(&self, key: &str) -> u32 {
        self.held.get(key).map_or(0, |held| held.count)
    }

    /// Record a fresh acquisition with count 1.
    pub fn insert(&mut self, key: &str, token: LockToken) {
        self.held.insert(key.to_string(), HeldLock { token, count: 1 });
    }

    /// Bump the reentry count, returning the new count.
    pub fn reenter(&mut self, key: &str) -> u32 {
        match self.held.get_mut(key) {
            Some(held) => {
                held.count += 1;
                held.count
            }
            None => 0,
        }
    }

    /// Undo one acquisition, returning how many remain.
    ///
    /// The entry is removed once the count reaches zero.
    pub fn exit(&mut self, key: &str) -> u32 {
        let Some(held) = self.held.get_mut(key) else {
            return 0;
        };
        held.count = held.count.saturating_sub(1);
        let remaining = held.count;
        if remaining == 0 {
            self.held.remove(key);
        }
        remaining
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.held.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Remove every entry, returning key and token pairs.
    pub fn drain(&mut self) -> Vec<(String, LockToken)> {
        self.held
            .drain()
            .map(|(key, held)| (key, held.token))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}
