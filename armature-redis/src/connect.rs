//! Topology-specific connection setup.

use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use redis::aio::MultiplexedConnection;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::sentinel::{SentinelClient, SentinelNodeConnectionInfo, SentinelServerType};
use redis::{ErrorKind, RedisConnectionInfo, ServerErrorKind, TlsMode};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{RedisConfig, RedisError, Result};

/// bb8 pool of multiplexed connections to a single node.
pub type RedisPool = Pool<RedisConnectionManager>;

/// Build the standalone pool and probe it with a `PING`.
pub(crate) async fn standalone(config: &RedisConfig) -> Result<RedisPool> {
    let manager = RedisConnectionManager::new(config.connection_url()?)
        .map_err(|e| RedisError::Connection(e.to_string()))?;

    let pool = Pool::builder()
        .max_size(config.pool_size)
        .min_idle(config.min_idle)
        .connection_timeout(config.connection_timeout)
        .build(manager)
        .await
        .map_err(|e| RedisError::Pool(e.to_string()))?;

    {
        let mut conn = pool.get().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;
    }

    info!(
        pool_size = config.pool_size,
        database = config.database,
        "Redis connection pool created"
    );
    Ok(pool)
}

/// Open a slot-routing connection to the configured cluster nodes.
pub(crate) async fn cluster(config: &RedisConfig) -> Result<ClusterConnection> {
    let nodes = config.cluster_urls()?;
    let node_count = nodes.len();
    let client = ClusterClient::new(nodes).map_err(|e| RedisError::Cluster(e.to_string()))?;

    let conn = tokio::time::timeout(config.connection_timeout, client.get_async_connection())
        .await
        .map_err(|_| RedisError::Timeout)?
        .map_err(|e| RedisError::Cluster(e.to_string()))?;

    info!(nodes = node_count, "Redis cluster connection established");
    Ok(conn)
}

/// Master connection located through Redis Sentinel.
///
/// The resolved connection is cached until a command fails in a way that
/// suggests a failover; the next command then asks the sentinels again.
pub(crate) struct SentinelMaster {
    master: String,
    state: Mutex<SentinelState>,
}

struct SentinelState {
    client: SentinelClient,
    conn: Option<MultiplexedConnection>,
}

impl SentinelMaster {
    /// Current master connection, resolving it if none is cached.
    pub(crate) async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut state = self.state.lock().await;
        if let Some(conn) = &state.conn {
            return Ok(conn.clone());
        }

        let conn = state
            .client
            .get_async_connection()
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;
        info!(master = %self.master, "Resolved Redis master through Sentinel");
        state.conn = Some(conn.clone());
        Ok(conn)
    }

    /// Drop the cached connection if `err` means the master moved or went away.
    pub(crate) async fn observe(&self, err: &redis::RedisError) {
        if is_failover_error(err) {
            warn!(master = %self.master, error = %err, "Redis master connection lost, re-resolving");
            self.state.lock().await.conn = None;
        }
    }
}

/// Errors after which the cached master is no longer trusted: the connection
/// broke, or the node was demoted to a read-only replica.
fn is_failover_error(err: &redis::RedisError) -> bool {
    err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || matches!(err.kind(), ErrorKind::Server(ServerErrorKind::ReadOnly))
}

/// Credentials, database and TLS mode for the master Sentinel hands out.
fn master_connection_info(config: &RedisConfig) -> SentinelNodeConnectionInfo {
    let mut redis_info = RedisConnectionInfo::default();
    if let Some(password) = &config.password {
        if let Some(username) = &config.username {
            redis_info = redis_info.set_username(username);
        }
        redis_info = redis_info.set_password(password);
    }
    if let Some(db) = config.database {
        redis_info = redis_info.set_db(i64::from(db));
    }

    let node_info = SentinelNodeConnectionInfo::default().set_redis_connection_info(redis_info);
    if config.tls {
        node_info.set_tls_mode(TlsMode::Secure)
    } else {
        node_info
    }
}

/// Resolve the configured master through its sentinels and connect to it.
pub(crate) async fn sentinel(config: &RedisConfig) -> Result<SentinelMaster> {
    let master = config
        .sentinel_master
        .clone()
        .ok_or_else(|| RedisError::Config("sentinel master name is not set".to_string()))?;
    let nodes = config.sentinel_urls()?;
    let node_count = nodes.len();

    let client = SentinelClient::build(
        nodes,
        master.clone(),
        Some(master_connection_info(config)),
        SentinelServerType::Master,
    )
    .map_err(|e| RedisError::Config(e.to_string()))?;

    let resolved = SentinelMaster {
        master,
        state: Mutex::new(SentinelState { client, conn: None }),
    };
    tokio::time::timeout(config.connection_timeout, resolved.connection())
        .await
        .map_err(|_| RedisError::Timeout)??;

    info!(
        master = %resolved.master,
        sentinels = node_count,
        "Redis Sentinel connection established"
    );
    Ok(resolved)
}
