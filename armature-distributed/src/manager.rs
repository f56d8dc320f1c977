//! Process-wide lock manager.

use armature_redis::RedisConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LockConfig;
use crate::context::LockContext;
use crate::error::{LockError, LockResult};
use crate::record::{millis, now_millis, LockInfo, LockRecord};
use crate::registry::LockRegistry;
use crate::stores::{LockStore, RedisLockStore};
use crate::token::LockToken;
use crate::watchdog::{self, WatchdogTick};

/// State shared by the manager handles, every context and the watchdog.
pub(crate) struct Shared {
    pub store: Arc<dyn LockStore>,
    pub registry: LockRegistry,
    pub config: LockConfig,
    pub shutdown: CancellationToken,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    next_context_id: AtomicU64,
}

impl Shared {
    /// Push the store expiry of `record` out by the renewal extension.
    ///
    /// The registry follows only when the store accepted the renewal.
    pub async fn renew(&self, record: &LockRecord) -> LockResult<bool> {
        let expires_at = now_millis().saturating_add(millis(self.config.renewal_extension()));
        let renewed = self
            .store
            .renew(&record.key, record.token.as_str(), expires_at)
            .await?;

        if renewed {
            self.registry
                .update_expiry(&record.key, &record.token, expires_at);
            debug!(key = %record.key, expires_at, "Renewed lock lease");
        } else {
            warn!(key = %record.key, "Lock renewal rejected, lease already lost");
        }

        Ok(renewed)
    }

    /// Drop the registry record and release the store entry if it still
    /// carries `token`.
    ///
    /// Store failures are logged; the lease then runs out on its own.
    pub async fn release_in_store(&self, key: &str, token: &LockToken) -> bool {
        self.registry.remove(key, token);

        match self.store.release(key, token.as_str()).await {
            Ok(true) => {
                debug!(key = %key, "Released lock");
                true
            }
            Ok(false) => {
                warn!(key = %key, "Lock expired or changed hands before release");
                false
            }
            Err(e) => {
                error!(key = %key, error = %e, "Failed to release lock in store");
                false
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Entry point for reentrant distributed locks.
///
/// Owns the lock store, the registry of locks held by this process and the
/// watchdog that renews and reaps them. Cloning is cheap; all clones share
/// the same state. Locks themselves are taken through a [`LockContext`].
///
/// # Examples
///
/// ```rust,ignore
/// use armature_distributed::{LockConfig, LockManager, MemoryLockStore};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let manager = LockManager::new(Arc::new(MemoryLockStore::new()), LockConfig::default())?;
/// let mut ctx = manager.context();
///
/// if let Some(token) = ctx.try_lock("report:daily", Duration::from_secs(5)).await? {
///     // critical section
///     ctx.release_lock("report:daily", &token).await?;
/// }
/// ```
#[derive(Clone)]
pub struct LockManager {
    shared: Arc<Shared>,
}

impl LockManager {
    /// Create a manager over `store` and start its watchdog.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(store: Arc<dyn LockStore>, config: LockConfig) -> LockResult<Self> {
        config.validate()?;

        let runtime = Handle::try_current()
            .map_err(|e| LockError::config(format!("lock manager needs a Tokio runtime: {}", e)))?;

        info!(
            store = store.store_type(),
            lease_ms = config.lease.as_millis() as u64,
            watchdog_ms = config.watchdog_period().as_millis() as u64,
            "Starting lock manager"
        );

        let shared = Arc::new(Shared {
            store,
            registry: LockRegistry::new(),
            config,
            shutdown: CancellationToken::new(),
            watchdog: Mutex::new(None),
            next_context_id: AtomicU64::new(1),
        });

        let handle = watchdog::spawn(&runtime, &shared);
        *shared.watchdog.lock() = Some(handle);

        Ok(Self { shared })
    }

    /// Create a manager with the default configuration.
    pub fn with_defaults(store: Arc<dyn LockStore>) -> LockResult<Self> {
        Self::new(store, LockConfig::default())
    }

    /// Connect to Redis and create a manager backed by it.
    pub async fn connect_redis(redis: RedisConfig, config: LockConfig) -> LockResult<Self> {
        let store = RedisLockStore::connect(redis).await?;
        Self::new(Arc::new(store), config)
    }

    /// Create a new lock context.
    ///
    /// Each concurrent task that takes locks should own its own context;
    /// reentrancy is tracked per context.
    pub fn context(&self) -> LockContext {
        let id = self.shared.next_context_id.fetch_add(1, Ordering::Relaxed);
        LockContext::new(self.shared.clone(), id)
    }

    /// Active configuration.
    pub fn config(&self) -> &LockConfig {
        &self.shared.config
    }

    /// Name of the underlying store.
    pub fn store_type(&self) -> &'static str {
        self.shared.store.store_type()
    }

    /// Locks this process believes it holds, earliest expiry first.
    pub fn held_locks(&self) -> Vec<LockInfo> {
        self.shared
            .registry
            .snapshot()
            .iter()
            .map(LockInfo::from)
            .collect()
    }

    /// Run one watchdog pass now, outside the regular schedule.
    pub async fn run_watchdog(&self) -> WatchdogTick {
        watchdog::tick(&self.shared).await
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.is_shut_down()
    }

    /// Stop the watchdog and refuse further acquisitions.
    ///
    /// Pending acquisitions give up. With `release_held`, every lock still in
    /// the registry is released in the store; otherwise the leases run out on
    /// their own. Returns the number of locks released. Calling it again is a
    /// no-op.
    pub async fn shutdown(&self, release_held: bool) -> usize {
        if self.shared.is_shut_down() {
            return 0;
        }

        info!(release_held, "Shutting down lock manager");
        self.shared.shutdown.cancel();

        let handle = self.shared.watchdog.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Lock watchdog did not stop cleanly");
            }
        }

        if !release_held {
            return 0;
        }

        let mut released = 0;
        for record in self.shared.registry.drain() {
            if self.shared.release_in_store(&record.key, &record.token).await {
                released += 1;
            }
        }

        info!(released, "Released held locks on shutdown");
        released
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("store", &self.shared.store.store_type())
            .field("held", &self.shared.registry.len())
            .field("shut_down", &self.shared.is_shut_down())
            .finish()
    }
}
