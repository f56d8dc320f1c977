//! Redis service shared by the lock stores.

use redis::cluster_async::ClusterConnection;
use redis::{FromRedisValue, Script};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::connect::{self, RedisPool, SentinelMaster};
use crate::{RedisConfig, RedisError, Result};

/// Connection topology backing a [`RedisService`].
enum Backend {
    /// Single node behind a bb8 pool.
    Pooled(RedisPool),
    /// Redis Cluster; the connection multiplexes and routes by key slot.
    Cluster(ClusterConnection),
    /// Master located through Redis Sentinel, re-resolved after failover.
    Sentinel(SentinelMaster),
}

/// Redis service providing connections and the handful of commands the
/// lock algorithm needs.
///
/// Every command is bounded by [`RedisConfig::command_timeout`].
pub struct RedisService {
    config: RedisConfig,
    backend: Backend,
}

impl RedisService {
    /// Create a new Redis service, choosing the topology from the config.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        if config.cluster && config.sentinel_master.is_some() {
            return Err(RedisError::Config(
                "cluster and sentinel modes are mutually exclusive".to_string(),
            ));
        }

        let backend = if config.cluster {
            Backend::Cluster(connect::cluster(&config).await?)
        } else if config.is_sentinel() {
            Backend::Sentinel(connect::sentinel(&config).await?)
        } else {
            Backend::Pooled(connect::standalone(&config).await?)
        };
        Ok(Self { config, backend })
    }

    /// Create from an existing pool.
    pub fn from_pool(config: RedisConfig, pool: RedisPool) -> Self {
        Self {
            config,
            backend: Backend::Pooled(pool),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Whether this service talks to a Redis Cluster.
    pub fn is_cluster(&self) -> bool {
        matches!(self.backend, Backend::Cluster(_))
    }

    /// Whether this service follows a Sentinel-managed master.
    pub fn is_sentinel(&self) -> bool {
        matches!(self.backend, Backend::Sentinel(_))
    }

    /// Check if the connection is healthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: String = self
            .query(&redis::cmd("PING"))
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;
        Ok(())
    }

    /// Run a single command against whichever topology is configured.
    pub async fn query<T>(&self, cmd: &redis::Cmd) -> Result<T>
    where
        T: FromRedisValue + Send,
    {
        self.bounded(async {
            match &self.backend {
                Backend::Pooled(pool) => {
                    let mut conn = pool.get().await?;
                    Ok(cmd.query_async(&mut *conn).await?)
                }
                Backend::Cluster(conn) => {
                    let mut conn = conn.clone();
                    Ok(cmd.query_async(&mut conn).await?)
                }
                Backend::Sentinel(master) => {
                    let mut conn = master.connection().await?;
                    let reply: redis::RedisResult<T> = cmd.query_async(&mut conn).await;
                    if let Err(e) = &reply {
                        master.observe(e).await;
                    }
                    Ok(reply?)
                }
            }
        })
        .await
    }

    /// Execute a Lua script (EVALSHA, falling back to EVAL on a cache miss).
    pub async fn run_script<T>(&self, script: &Script, keys: &[&str], args: &[&str]) -> Result<T>
    where
        T: FromRedisValue + Send,
    {
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(*arg);
        }

        self.bounded(async {
            match &self.backend {
                Backend::Pooled(pool) => {
                    let mut conn = pool.get().await?;
                    Ok(invocation.invoke_async(&mut *conn).await?)
                }
                Backend::Cluster(conn) => {
                    let mut conn = conn.clone();
                    Ok(invocation.invoke_async(&mut conn).await?)
                }
                Backend::Sentinel(master) => {
                    let mut conn = master.connection().await?;
                    let reply: redis::RedisResult<T> = invocation.invoke_async(&mut conn).await;
                    if let Err(e) = &reply {
                        master.observe(e).await;
                    }
                    Ok(reply?)
                }
            }
        })
        .await
    }

    /// `SET key value NX PX ttl`; true iff the key was absent and is now set.
    pub async fn set_nx_px(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(value)
            .arg("NX") // Only set if not exists
            .arg("PX") // Expiry in milliseconds
            .arg(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));

        // SET … NX replies OK when the key was set, nil otherwise
        let reply: Option<String> = self.query(&cmd).await?;
        debug!(key = %key, acquired = reply.is_some(), "SET NX PX");
        Ok(reply.is_some())
    }

    /// Get a value.
    pub async fn get_value<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromRedisValue + Send,
    {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query(&cmd).await
    }

    /// Delete a key.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let deleted: u32 = self.query(&cmd).await?;
        Ok(deleted > 0)
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.config.command_timeout, fut)
            .await
            .map_err(|_| RedisError::Timeout)?
    }
}
