//! Per-task lock handle.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acquire::{self, AcquireRequest};
use crate::error::{LockError, LockResult};
use crate::manager::Shared;
use crate::record::{Liveness, OwnerHandle};
use crate::state::ContextLockState;
use crate::token::LockToken;

/// A caller's view of the lock manager.
///
/// Reentrancy is tracked per context: acquiring a key this context already
/// holds returns the same token and bumps a counter, and the store entry is
/// only released once every acquisition has been matched by a release.
/// Contexts are cheap; give each concurrent task its own.
///
/// Dropping a context releases whatever it still holds in the background.
/// If no runtime is available at that point, the watchdog reaps the locks
/// on its next pass.
pub struct LockContext {
    id: u64,
    shared: Arc<Shared>,
    state: ContextLockState,
    liveness: Arc<Liveness>,
}

impl LockContext {
    pub(crate) fn new(shared: Arc<Shared>, id: u64) -> Self {
        Self {
            id,
            shared,
            state: ContextLockState::new(),
            liveness: Liveness::new(),
        }
    }

    /// Identifier of this context, unique within its manager.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Acquire `key` with a renewable lease, waiting up to `wait`.
    ///
    /// Returns `Ok(None)` when the lock could not be taken in time. A zero
    /// wait still makes one attempt.
    pub async fn try_lock(&mut self, key: &str, wait: Duration) -> LockResult<Option<LockToken>> {
        self.lock(key, wait, None, None).await
    }

    /// Acquire `key` with a fixed lease the watchdog never extends.
    ///
    /// Re-entering a fixed-lease lock is rejected with
    /// [`LockError::Unsupported`].
    pub async fn try_lock_with_lease(
        &mut self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> LockResult<Option<LockToken>> {
        self.lock(key, wait, Some(lease), None).await
    }

    /// Like [`try_lock`](Self::try_lock) but gives up as soon as `cancel`
    /// fires. `lease` of `None` means renewable.
    pub async fn try_lock_until(
        &mut self,
        key: &str,
        wait: Duration,
        lease: Option<Duration>,
        cancel: &CancellationToken,
    ) -> LockResult<Option<LockToken>> {
        self.lock(key, wait, lease, Some(cancel)).await
    }

    async fn lock(
        &mut self,
        key: &str,
        wait: Duration,
        lease: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> LockResult<Option<LockToken>> {
        if key.trim().is_empty() {
            return Err(LockError::invalid_argument("lock key must not be blank"));
        }
        if lease.is_some_and(|lease| lease.is_zero()) {
            return Err(LockError::invalid_argument("fixed lease must be greater than zero"));
        }
        if self.shared.is_shut_down() {
            return Err(LockError::ShutDown);
        }

        if let Some(token) = self.state.token(key) {
            return self.reenter(key, token).await.map(Some);
        }

        let request = AcquireRequest {
            key,
            lease,
            wait,
            owner: OwnerHandle::of(&self.liveness),
            cancel,
        };

        let acquired = acquire::acquire(&self.shared, request).await;
        if let Some(token) = &acquired {
            self.state.insert(key, token.clone());
        }
        Ok(acquired)
    }

    async fn reenter(&mut self, key: &str, token: LockToken) -> LockResult<LockToken> {
        match self.shared.registry.get(key) {
            Some(record) if record.token == token => {
                if !record.renewable {
                    return Err(LockError::unsupported(format!(
                        "lock '{}' has a fixed lease and cannot be re-entered",
                        key
                    )));
                }
                if let Err(e) = self.shared.renew(&record).await {
                    warn!(key = %key, error = %e, "Failed to extend lease on reentry");
                }
            }
            _ => {
                // The watchdog already reaped it; the caller keeps the count
                // and must treat the critical section as unprotected
                warn!(
                    key = %key,
                    context = self.id,
                    "Re-entering a lock whose lease was lost"
                );
            }
        }

        let count = self.state.reenter(key);
        debug!(key = %key, count, context = self.id, "Re-entered lock");
        Ok(token)
    }

    /// Release one acquisition of `key`.
    ///
    /// Returns `Ok(true)` if this context held `key` under `token`; the store
    /// entry is removed when the last nested acquisition is released. Returns
    /// `Ok(false)` for a token mismatch, a key this context does not hold, or
    /// a final release the store could not confirm.
    pub async fn release_lock(&mut self, key: &str, token: impl AsRef<str>) -> LockResult<bool> {
        let token = token.as_ref();
        if key.trim().is_empty() || token.trim().is_empty() {
            return Err(LockError::invalid_argument(format!(
                "lock key and token must not be blank (key: '{}', token: '{}')",
                key, token
            )));
        }

        let Some(held) = self.state.token(key) else {
            warn!(key = %key, context = self.id, "Release of a lock this context does not hold");
            return Ok(false);
        };

        if held.as_str() != token {
            warn!(key = %key, context = self.id, "Release with a stale or foreign token");
            return Ok(false);
        }

        let remaining = self.state.exit(key);
        if remaining > 0 {
            debug!(key = %key, remaining, context = self.id, "Released nested lock");
            return Ok(true);
        }

        Ok(self.shared.release_in_store(key, &held).await)
    }

    /// Whether this context holds `key`.
    pub fn is_held(&self, key: &str) -> bool {
        self.state.count(key) > 0
    }

    /// Reentry count of `key` in this context, `0` if not held.
    pub fn hold_count(&self, key: &str) -> u32 {
        self.state.count(key)
    }

    /// Keys held by this context, sorted.
    pub fn held_keys(&self) -> Vec<String> {
        self.state.keys()
    }
}

impl std::fmt::Debug for LockContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockContext")
            .field("id", &self.id)
            .field("held", &self.state.len())
            .finish()
    }
}

impl Drop for LockContext {
    fn drop(&mut self) {
        if self.state.is_empty() {
            return;
        }
        let held = self.state.drain();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                context = self.id,
                locks = held.len(),
                "Lock context dropped outside a runtime, leaving its locks to the watchdog"
            );
            return;
        };

        debug!(context = self.id, locks = held.len(), "Releasing locks of dropped context");
        let shared = self.shared.clone();
        runtime.spawn(async move {
            for (key, token) in held {
                shared.release_in_store(&key, &token).await;
            }
        });
    }
}
