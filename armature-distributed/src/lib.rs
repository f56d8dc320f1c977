//! Reentrant Distributed Locks for Armature
//!
//! Mutual exclusion across processes, backed by a shared key-value store.
//!
//! ## Features
//!
//! - **Fencing Tokens** - Every acquisition mints a token; only its holder can renew or release
//! - **Reentrancy** - A [`LockContext`] may take the same key repeatedly and must release it as often
//! - **Bounded Waiting** - Retries with capped exponential backoff and jitter, cancellable
//! - **Watchdog** - Renewable leases are extended in the background; orphaned locks are reaped
//! - **Pluggable Stores** - Redis (standalone or cluster) and in-memory
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use armature_distributed::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = LockManager::connect_redis(
//!         armature_redis::RedisConfig::from_env().build(),
//!         LockConfig::from_env().build(),
//!     )
//!     .await?;
//!
//!     let mut ctx = manager.context();
//!     if let Some(token) = ctx.try_lock("invoice:42", Duration::from_secs(5)).await? {
//!         // Critical section; the watchdog keeps the lease alive
//!         ctx.release_lock("invoice:42", &token).await?;
//!     }
//!
//!     manager.shutdown(true).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Fixed Leases
//!
//! ```rust,ignore
//! // Expires after 10 seconds no matter what; never renewed, not re-enterable
//! let token = ctx
//!     .try_lock_with_lease("nightly-export", Duration::ZERO, Duration::from_secs(10))
//!     .await?;
//! ```

mod acquire;
mod config;
mod context;
mod error;
mod manager;
mod record;
mod registry;
mod state;
pub mod stores;
mod token;
mod watchdog;

pub use config::{LockConfig, LockConfigBuilder, DEFAULT_LEASE};
pub use context::LockContext;
pub use error::{LockError, LockResult};
pub use manager::LockManager;
pub use record::LockInfo;
pub use stores::{LockStore, MemoryLockStore, RedisLockStore};
pub use token::LockToken;
pub use watchdog::WatchdogTick;

// Cancellation handle accepted by `LockContext::try_lock_until`
pub use tokio_util::sync::CancellationToken;

/// Prelude for common imports.
///
/// ```
/// use armature_distributed::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{LockConfig, LockConfigBuilder};
    pub use crate::context::LockContext;
    pub use crate::error::{LockError, LockResult};
    pub use crate::manager::LockManager;
    pub use crate::stores::{LockStore, MemoryLockStore, RedisLockStore};
    pub use crate::token::LockToken;
    pub use tokio_util::sync::CancellationToken;
}
