//! Background renewal and reaping of registry records.
//!
//! One watchdog task runs per [`LockManager`](crate::LockManager). Every
//! period it walks the records that expire within one lease and, per record:
//!
//! - reaps it (store release plus registry removal) when the owning context
//!   is gone or the expiry has already passed;
//! - renews it when it is renewable;
//! - leaves fixed-lease records alone until they expire.

use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::manager::Shared;
use crate::record::{millis, now_millis};

/// Outcome of one watchdog pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WatchdogTick {
    /// Records within the renewal horizon.
    pub scanned: usize,
    /// Leases extended in the store.
    pub renewed: usize,
    /// Records dropped because the owner died or the lease lapsed.
    pub reaped: usize,
    /// Renewals the store rejected or failed to answer.
    pub failed: usize,
}

/// Spawn the periodic watchdog on `runtime`.
///
/// The task holds only a weak reference to the manager state and stops on
/// shutdown or once that state is dropped.
pub(crate) fn spawn(runtime: &Handle, shared: &Arc<Shared>) -> JoinHandle<()> {
    let weak: Weak<Shared> = Arc::downgrade(shared);
    let shutdown = shared.shutdown.clone();
    let period = shared.config.watchdog_period();

    runtime.spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_ms = period.as_millis() as u64, "Lock watchdog started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let Some(shared) = weak.upgrade() else {
                break;
            };

            // A panicking pass must not take the loop down with it
            match tokio::spawn(async move { tick(&shared).await }).await {
                Ok(_) => {}
                Err(e) if e.is_panic() => error!(error = %e, "Lock watchdog pass panicked"),
                Err(e) => warn!(error = %e, "Lock watchdog pass aborted"),
            }
        }

        info!("Lock watchdog stopped");
    })
}

/// Run a single watchdog pass.
pub(crate) async fn tick(shared: &Shared) -> WatchdogTick {
    let now = now_millis();
    let horizon = now.saturating_add(millis(shared.config.lease));
    let due = shared.registry.due_before(horizon);

    let mut summary = WatchdogTick {
        scanned: due.len(),
        ..WatchdogTick::default()
    };

    for record in due {
        if !record.owner.is_alive() || record.expires_at < now {
            debug!(
                key = %record.key,
                owner_alive = record.owner.is_alive(),
                expires_at = record.expires_at,
                "Reaping lock"
            );
            shared.release_in_store(&record.key, &record.token).await;
            summary.reaped += 1;
        } else if record.renewable {
            match shared.renew(&record).await {
                Ok(true) => summary.renewed += 1,
                Ok(false) => summary.failed += 1,
                Err(e) => {
                    warn!(key = %record.key, error = %e, "Lock renewal failed, retrying next pass");
                    summary.failed += 1;
                }
            }
        }
    }

    if summary.scanned > 0 {
        debug!(
            scanned = summary.scanned,
            renewed = summary.renewed,
            reaped = summary.reaped,
            failed = summary.failed,
            "Lock watchdog pass"
        );
    } else {
        trace!("Lock watchdog pass found nothing due");
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use crate::manager::LockManager;
    use crate::record::{Liveness, LockRecord, OwnerHandle};
    use crate::stores::{LockStore, MemoryLockStore};
    use crate::token::LockToken;
    use std::time::Duration;

    const LEASE: Duration = Duration::from_secs(3);
    /// Inside the renewal horizon of a fresh pass.
    const DUE: Duration = Duration::from_millis(2_500);

    fn manager(store: Arc<MemoryLockStore>) -> LockManager {
        // Background passes stay out of the way; tests drive `tick` directly
        let config = LockConfig::builder()
            .lease(LEASE)
            .watchdog_interval(Duration::from_millis(2_900))
            .build();
        LockManager::new(store, config).unwrap()
    }

    async fn hold(
        manager: &LockManager,
        store: &MemoryLockStore,
        key: &str,
        lease: Duration,
        renewable: bool,
        owner: &Arc<Liveness>,
    ) -> LockToken {
        let token = LockToken::generate();
        assert!(store.acquire(key, token.as_str(), lease).await.unwrap());
        manager.shared().registry.insert(LockRecord {
            key: key.to_string(),
            token: token.clone(),
            expires_at: now_millis() + millis(lease),
            renewable,
            owner: OwnerHandle::of(owner),
        });
        token
    }

    #[tokio::test]
    async fn test_renews_live_renewable_lock() {
        let store = Arc::new(MemoryLockStore::new());
        let manager = manager(store.clone());
        let owner = Liveness::new();
        let token = hold(&manager, &store, "job", DUE, true, &owner).await;

        let summary = tick(manager.shared()).await;

        assert_eq!(summary.scanned, 1);
        assert_eq!(summary.renewed, 1);
        let record = manager.shared().registry.get("job").unwrap();
        assert_eq!(record.token, token);
        assert!(record.expires_at > now_millis() + millis(LEASE));
        assert!(store.ttl("job").unwrap() > LEASE);
    }

    #[tokio::test]
    async fn test_reaps_dead_owner() {
        let store = Arc::new(MemoryLockStore::new());
        let manager = manager(store.clone());
        let owner = Liveness::new();
        hold(&manager, &store, "job", DUE, true, &owner).await;
        drop(owner);

        let summary = tick(manager.shared()).await;

        assert_eq!(summary.reaped, 1);
        assert!(manager.shared().registry.get("job").is_none());
        assert!(store.get("job").is_none());
    }

    #[tokio::test]
    async fn test_reaps_expired_record() {
        let store = Arc::new(MemoryLockStore::new());
        let manager = manager(store.clone());
        let owner = Liveness::new();
        hold(&manager, &store, "job", Duration::from_millis(10), false, &owner).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let summary = tick(manager.shared()).await;

        assert_eq!(summary.reaped, 1);
        assert!(manager.shared().registry.is_empty());
    }

    #[tokio::test]
    async fn test_skips_live_fixed_lease() {
        let store = Arc::new(MemoryLockStore::new());
        let manager = manager(store.clone());
        let owner = Liveness::new();
        let token = hold(&manager, &store, "fixed", DUE, false, &owner).await;
        hold(&manager, &store, "renewable", DUE, true, &owner).await;

        let summary = tick(manager.shared()).await;

        assert_eq!(summary.scanned, 2);
        assert_eq!(summary.renewed, 1);
        assert_eq!(summary.reaped, 0);
        assert_eq!(manager.shared().registry.get("fixed").unwrap().token, token);
    }

    #[tokio::test]
    async fn test_reap_leaves_new_holder_untouched() {
        let store = Arc::new(MemoryLockStore::new());
        let manager = manager(store.clone());
        let owner = Liveness::new();
        hold(&manager, &store, "job", Duration::from_millis(10), true, &owner).await;

        // Lease lapses and another process takes the key
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.acquire("job", "someone-else", LEASE).await.unwrap());

        let summary = tick(manager.shared()).await;

        assert_eq!(summary.reaped, 1);
        assert!(manager.shared().registry.is_empty());
        assert_eq!(store.get("job"), Some("someone-else".to_string()));
    }

    #[tokio::test]
    async fn test_rejected_renewal_counts_as_failed() {
        let store = Arc::new(MemoryLockStore::new());
        let manager = manager(store.clone());
        let owner = Liveness::new();
        let token = hold(&manager, &store, "job", DUE, true, &owner).await;

        // Store entry vanished behind our back, the local record still looks live
        assert!(store.release("job", token.as_str()).await.unwrap());

        let summary = tick(manager.shared()).await;

        assert_eq!(summary.failed, 1);
        assert!(manager.shared().registry.get("job").is_some());
    }

    #[tokio::test]
    async fn test_nothing_due() {
        let store = Arc::new(MemoryLockStore::new());
        let manager = manager(store);

        assert_eq!(tick(manager.shared()).await, WatchdogTick::default());
    }
}
