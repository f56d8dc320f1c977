//! # Armature Lock
//!
//! Reentrant distributed locks over a shared key-value store.
//!
//! This crate bundles the lock engine from `armature-distributed` with the
//! Redis plumbing from `armature-redis`.
//!
//! ```rust,ignore
//! use armature_lock::prelude::*;
//! use std::time::Duration;
//!
//! let manager = LockManager::connect_redis(
//!     RedisConfig::from_env().build(),
//!     LockConfig::from_env().build(),
//! )
//! .await?;
//!
//! let mut ctx = manager.context();
//! if let Some(token) = ctx.try_lock("job-1", Duration::from_secs(3)).await? {
//!     run_job().await;
//!     ctx.release_lock("job-1", &token).await?;
//! }
//! ```

pub use armature_distributed::*;

// Redis plumbing
pub use armature_redis;
pub use armature_redis::{RedisConfig, RedisConfigBuilder, RedisError, RedisService};

/// Prelude for common imports.
pub mod prelude {
    pub use armature_distributed::prelude::*;
    pub use armature_redis::{RedisConfig, RedisConfigBuilder};
}
