//! Redis lock store
//!
//! Uses Redis for locks shared across every process. Acquire, release and
//! renew are Lua scripts so the token comparison and the mutation happen in
//! one step on the server.

use crate::error::LockResult;
use crate::record::millis;
use crate::stores::LockStore;
use armature_redis::{RedisConfig, RedisService, Script};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Redis refuses expiries that overflow its clock; leases are capped at a century.
const MAX_LEASE_MS: i64 = 100 * 365 * 86_400_000;

/// Take the key when absent. A key already holding the caller's token counts
/// as taken, so an attempt whose reply was lost can be repeated.
const ACQUIRE_SCRIPT: &str = r#"
local current = redis.call("get", KEYS[1])
if current == ARGV[1] then
    redis.call("pexpire", KEYS[1], ARGV[2])
    return 1
end
if current == false then
    redis.call("set", KEYS[1], ARGV[1], "PX", ARGV[2])
    return 1
end
return 0
"#;

/// Delete the key only while it still holds the caller's token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Move the key's absolute expiry only while it still holds the caller's token.
const RENEW_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpireat", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Redis-backed lock store
///
/// Works against a standalone node, a cluster or a Sentinel-managed master;
/// every lock touches a single key, so the scripts are always routed to one slot.
pub struct RedisLockStore {
    redis: Arc<RedisService>,
    acquire_script: Script,
    release_script: Script,
    renew_script: Script,
}

impl RedisLockStore {
    /// Create a store on top of an existing service.
    pub fn new(redis: Arc<RedisService>) -> Self {
        Self {
            redis,
            acquire_script: Script::new(ACQUIRE_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
            renew_script: Script::new(RENEW_SCRIPT),
        }
    }

    /// Connect to Redis and create a store.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn connect(config: RedisConfig) -> LockResult<Self> {
        debug!(
            cluster = config.cluster,
            sentinel = config.is_sentinel(),
            "Connecting to Redis for locks"
        );
        let redis = RedisService::new(config).await?;
        Ok(Self::new(Arc::new(redis)))
    }

    /// The underlying Redis service.
    pub fn service(&self) -> &Arc<RedisService> {
        &self.redis
    }

    /// Current holder token of `key`, straight from Redis.
    pub async fn holder(&self, key: &str) -> LockResult<Option<String>> {
        Ok(self.redis.get_value(key).await?)
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    async fn acquire(&self, key: &str, token: &str, lease: Duration) -> LockResult<bool> {
        let lease_ms = millis(lease).clamp(1, MAX_LEASE_MS).to_string();
        let acquired: i64 = self
            .redis
            .run_script(&self.acquire_script, &[key], &[token, lease_ms.as_str()])
            .await?;
        trace!(key = %key, acquired = acquired, "Redis acquire");
        Ok(acquired == 1)
    }

    async fn release(&self, key: &str, token: &str) -> LockResult<bool> {
        let deleted: i64 = self
            .redis
            .run_script(&self.release_script, &[key], &[token])
            .await?;
        trace!(key = %key, deleted = deleted, "Redis release");
        Ok(deleted == 1)
    }

    async fn renew(&self, key: &str, token: &str, expires_at_ms: i64) -> LockResult<bool> {
        let expires_at = expires_at_ms.to_string();
        let applied: i64 = self
            .redis
            .run_script(&self.renew_script, &[key], &[token, expires_at.as_str()])
            .await?;
        trace!(key = %key, applied = applied, "Redis renew");
        Ok(applied == 1)
    }

    fn store_type(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::now_millis;

    async fn store() -> RedisLockStore {
        RedisLockStore::connect(RedisConfig::from_env().build())
            .await
            .unwrap()
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_acquire_release_roundtrip() {
        let store = store().await;
        let key = "armature:lock:test:roundtrip";
        store.service().delete(key).await.unwrap();

        assert!(store.acquire(key, "t1", Duration::from_secs(5)).await.unwrap());
        assert!(!store.acquire(key, "t2", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.holder(key).await.unwrap(), Some("t1".to_string()));

        assert!(!store.release(key, "t2").await.unwrap());
        assert!(store.release(key, "t1").await.unwrap());
        assert_eq!(store.holder(key).await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_repeated_acquire_with_same_token() {
        let store = store().await;
        let key = "armature:lock:test:repeat";
        store.service().delete(key).await.unwrap();

        assert!(store.acquire(key, "t1", Duration::from_secs(5)).await.unwrap());
        assert!(store.acquire(key, "t1", Duration::from_secs(5)).await.unwrap());
        assert!(!store.acquire(key, "t2", Duration::from_secs(5)).await.unwrap());

        assert!(store.release(key, "t1").await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_renew_compares_token() {
        let store = store().await;
        let key = "armature:lock:test:renew";
        store.service().delete(key).await.unwrap();

        store.acquire(key, "t1", Duration::from_millis(500)).await.unwrap();
        let later = now_millis() + 10_000;

        assert!(!store.renew(key, "t2", later).await.unwrap());
        assert!(store.renew(key, "t1", later).await.unwrap());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.holder(key).await.unwrap(), Some("t1".to_string()));

        store.release(key, "t1").await.unwrap();
    }

    #[test]
    fn test_scripts_compare_before_mutating() {
        assert!(RELEASE_SCRIPT.contains(r#"redis.call("get", KEYS[1]) == ARGV[1]"#));
        assert!(RENEW_SCRIPT.contains("pexpireat"));
    }

    #[test]
    fn test_acquire_script_accepts_own_token() {
        assert!(ACQUIRE_SCRIPT.contains("current == ARGV[1]"));
        assert!(ACQUIRE_SCRIPT.contains("current == false"));
        assert!(ACQUIRE_SCRIPT.contains(r#""PX", ARGV[2]"#));
        assert_eq!(millis(Duration::MAX).clamp(1, MAX_LEASE_MS), MAX_LEASE_MS);
    }
}
