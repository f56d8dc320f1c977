//! # Armature Redis
//!
//! The Redis side of Armature's distributed locks: configuration, topology
//! selection and the few commands a lock store issues.
//!
//! A [`RedisService`] talks to a single node through a bb8 pool, to a Redis
//! Cluster through a slot-routing connection, or to the master a set of
//! Sentinels points at, picked from [`RedisConfig::cluster`] and
//! [`RedisConfig::sentinel_master`]. Every command it sends is bounded by
//! [`RedisConfig::command_timeout`].
//!
//! ```rust,ignore
//! use armature_redis::{RedisConfig, RedisService, Script};
//! use std::time::Duration;
//!
//! let redis = RedisService::new(RedisConfig::from_env().build()).await?;
//!
//! // Set-if-absent with a millisecond expiry
//! let fresh = redis.set_nx_px("job-1", "token-a", Duration::from_secs(30)).await?;
//!
//! // Compare-and-delete in one round-trip
//! let release = Script::new(r#"
//!     if redis.call("get", KEYS[1]) == ARGV[1] then
//!         return redis.call("del", KEYS[1])
//!     end
//!     return 0
//! "#);
//! let deleted: i64 = redis.run_script(&release, &["job-1"], &["token-a"]).await?;
//! ```
//!
//! Cluster mode:
//!
//! ```rust,ignore
//! let config = RedisConfig::builder()
//!     .cluster_nodes(vec!["redis://10.0.0.1:7000".into(), "redis://10.0.0.2:7000".into()])
//!     .build();
//! assert!(RedisService::new(config).await?.is_cluster());
//! ```
//!
//! Sentinel mode:
//!
//! ```rust,ignore
//! let config = RedisConfig::builder()
//!     .sentinel("mymaster", vec!["redis://10.0.0.1:26379".into()])
//!     .password("s3cret")
//!     .build();
//! assert!(RedisService::new(config).await?.is_sentinel());
//! ```

mod config;
mod connect;
mod error;
mod service;

pub use config::{RedisConfig, RedisConfigBuilder};
pub use connect::RedisPool;
pub use error::{RedisError, Result};
pub use service::RedisService;

pub use redis;
pub use redis::{RedisResult, Script, Value};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::config::{RedisConfig, RedisConfigBuilder};
    pub use crate::error::{RedisError, Result};
    pub use crate::service::RedisService;
}
