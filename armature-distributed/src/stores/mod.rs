//! Lock storage backends
//!
//! This module provides the store side of the lock algorithm:
//!
//! - **Redis**: Distributed storage shared by every process (production)
//! - **Memory**: In-process storage using DashMap (tests, single-instance)

mod memory;
mod redis_store;

pub use memory::MemoryLockStore;
pub use redis_store::RedisLockStore;

use crate::error::LockResult;
use async_trait::async_trait;
use std::time::Duration;

/// Atomic primitives the lock algorithm is built on.
///
/// Each operation must be a single indivisible step against the store; a
/// separate read followed by a write is unsafe under concurrent access.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key` to `token` with an expiry of now + `lease`, only if `key` is
    /// absent or already holds `token`.
    ///
    /// Returns `true` iff `key` now holds `token`. Repeating a call with the
    /// same token is safe, so an attempt whose outcome was lost can be retried.
    async fn acquire(&self, key: &str, token: &str, lease: Duration) -> LockResult<bool>;

    /// Delete `key` only if its current value equals `token`.
    ///
    /// Returns `true` iff the key was deleted.
    async fn release(&self, key: &str, token: &str) -> LockResult<bool>;

    /// Set the absolute expiry of `key` (Unix milliseconds) only if its
    /// current value equals `token`.
    ///
    /// Returns `true` iff the expiry was applied.
    async fn renew(&self, key: &str, token: &str, expires_at_ms: i64) -> LockResult<bool>;

    /// Get store type name for debugging
    fn store_type(&self) -> &'static str;
}
