//! Acquisition loop: bounded retry with capped exponential backoff.

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::LockConfig;
use crate::manager::Shared;
use crate::record::{millis, now_millis, LockRecord, OwnerHandle};
use crate::token::LockToken;

/// Stand-in deadline for waits too long to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Retry delay generator.
///
/// The base delay doubles after every failed attempt up to the cap; each
/// delay gets uniform jitter on top so competing waiters drift apart.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    next: Duration,
    max: Duration,
    jitter: Duration,
}

impl Backoff {
    pub fn new(config: &LockConfig) -> Self {
        Self {
            next: config.initial_backoff,
            max: config.max_backoff,
            jitter: config.backoff_jitter,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        base.saturating_add(self.sample_jitter())
    }

    fn sample_jitter(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

/// One `try_lock` call that missed the reentry fast path.
pub(crate) struct AcquireRequest<'a> {
    pub key: &'a str,
    /// `None` means renewable with the configured lease.
    pub lease: Option<Duration>,
    pub wait: Duration,
    pub owner: OwnerHandle,
    pub cancel: Option<&'a CancellationToken>,
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Run the acquisition loop until the store grants the lock, the wait budget
/// runs out, or the caller is cancelled.
///
/// At least one attempt is made, even with a zero wait. A store error counts
/// as a failed attempt. On success the record is already in the registry.
pub(crate) async fn acquire(shared: &Shared, request: AcquireRequest<'_>) -> Option<LockToken> {
    let AcquireRequest {
        key,
        lease,
        wait,
        owner,
        cancel,
    } = request;

    let renewable = lease.is_none();
    let lease = lease.unwrap_or(shared.config.lease);
    let token = LockToken::generate();
    let started = Instant::now();
    let deadline = started
        .checked_add(wait)
        .unwrap_or_else(|| started + FAR_FUTURE);
    let mut backoff = Backoff::new(&shared.config);
    let mut attempts: u32 = 0;

    loop {
        if shared.shutdown.is_cancelled() || cancel.is_some_and(|c| c.is_cancelled()) {
            debug!(key = %key, attempts, "Lock acquisition cancelled");
            return None;
        }

        attempts += 1;
        // Taken before the round-trip so the local expiry never outlives the store's
        let expires_at = now_millis().saturating_add(millis(lease));

        match shared.store.acquire(key, token.as_str(), lease).await {
            Ok(true) => {
                shared.registry.insert(LockRecord {
                    key: key.to_string(),
                    token: token.clone(),
                    expires_at,
                    renewable,
                    owner,
                });
                debug!(key = %key, attempts, renewable, "Acquired lock");
                return Some(token);
            }
            Ok(false) => {
                trace!(key = %key, attempts, "Lock held elsewhere");
            }
            Err(e) => {
                warn!(key = %key, attempts, error = %e, "Lock acquire attempt failed");
            }
        }

        let now = Instant::now();
        if now >= deadline {
            debug!(key = %key, attempts, "Lock wait budget exhausted");
            return None;
        }

        let delay = backoff.next_delay().min(deadline - now);
        tokio::select! {
            biased;
            _ = cancelled(cancel) => {
                debug!(key = %key, attempts, "Lock acquisition cancelled while waiting");
                return None;
            }
            _ = shared.shutdown.cancelled() => {
                debug!(key = %key, attempts, "Lock manager shut down while waiting");
                return None;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(jitter: Duration) -> Backoff {
        Backoff::new(
            &LockConfig::builder()
                .initial_backoff(Duration::from_millis(50))
                .max_backoff(Duration::from_millis(500))
                .backoff_jitter(jitter)
                .build(),
        )
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = backoff(Duration::ZERO);
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();

        assert_eq!(delays, vec![50, 100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_cancel_signal() {
        let mut never = tokio_test::task::spawn(cancelled(None));
        tokio_test::assert_pending!(never.poll());

        let token = CancellationToken::new();
        let mut waiting = tokio_test::task::spawn(cancelled(Some(&token)));
        tokio_test::assert_pending!(waiting.poll());

        token.cancel();
        assert!(waiting.is_woken());
        tokio_test::assert_ready!(waiting.poll());
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let mut backoff = backoff(Duration::from_millis(50));

        for expected_base in [50u64, 100, 200, 400, 500, 500, 500] {
            let delay = backoff.next_delay().as_millis() as u64;
            assert!(delay >= expected_base, "{delay} < {expected_base}");
            assert!(delay <= expected_base + 50, "{delay} > {expected_base} + 50");
        }
    }
}
