//! Lock records and owner liveness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::token::LockToken;

/// Wall-clock milliseconds since the Unix epoch, the unit of every expiry.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Whole milliseconds of `duration`, saturating at `i64::MAX`.
pub(crate) fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Marker owned by a lock context for as long as it is alive.
#[derive(Debug)]
pub(crate) struct Liveness;

impl Liveness {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

/// Weak reference from a registry record back to the acquiring context.
#[derive(Debug, Clone)]
pub(crate) struct OwnerHandle(Weak<Liveness>);

impl OwnerHandle {
    pub(crate) fn of(liveness: &Arc<Liveness>) -> Self {
        Self(Arc::downgrade(liveness))
    }

    /// The owning context has not been dropped yet.
    pub(crate) fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

/// This process's belief that it holds `key` in the store.
#[derive(Debug, Clone)]
pub(crate) struct LockRecord {
    pub key: String,
    pub token: LockToken,
    /// Absolute expiry, wall-clock milliseconds.
    pub expires_at: i64,
    /// Created without a fixed lease; the watchdog extends it.
    pub renewable: bool,
    pub owner: OwnerHandle,
}

/// Snapshot of a held lock, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Lock key.
    pub key: String,
    /// Fencing token of the current holder.
    pub token: LockToken,
    /// When the lease lapses unless renewed.
    pub expires_at: DateTime<Utc>,
    /// Whether the watchdog renews this lock.
    pub renewable: bool,
    /// Whether the acquiring context is still alive.
    pub owner_alive: bool,
}

impl From<&LockRecord> for LockInfo {
    fn from(record: &LockRecord) -> Self {
        Self {
            key: record.key.clone(),
            token: record.token.clone(),
            expires_at: DateTime::from_timestamp_millis(record.expires_at).unwrap_or_default(),
            renewable: record.renewable,
            owner_alive: record.owner.is_alive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_dies_with_liveness() {
        let liveness = Liveness::new();
        let owner = OwnerHandle::of(&liveness);

        assert!(owner.is_alive());

        drop(liveness);
        assert!(!owner.is_alive());
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), i64::MAX);
        assert_eq!(millis(Duration::from_secs(u64::MAX / 1000)), i64::MAX);
    }

    #[test]
    fn test_info_snapshot() {
        let liveness = Liveness::new();
        let record = LockRecord {
            key: "job-1".to_string(),
            token: LockToken::from("t1"),
            expires_at: 1_700_000_000_000,
            renewable: true,
            owner: OwnerHandle::of(&liveness),
        };

        let info = LockInfo::from(&record);
        assert_eq!(info.key, "job-1");
        assert_eq!(info.expires_at.timestamp_millis(), 1_700_000_000_000);
        assert!(info.owner_alive);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["token"], "t1");
    }
}
