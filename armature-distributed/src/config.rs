//! Lock configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{LockError, LockResult};

/// Default lease for renewable locks.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// Lock manager configuration.
///
/// Durations are (de)serialized as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease applied to renewable locks; the watchdog keeps extending it.
    #[serde(with = "duration_millis")]
    pub lease: Duration,
    /// Watchdog period. Defaults to a third of the lease.
    #[serde(with = "duration_millis::option")]
    pub watchdog_interval: Option<Duration>,
    /// First retry delay of the acquisition loop.
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,
    /// Upper bound of the doubling retry delay (jitter excluded).
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
    /// Uniform random jitter added to every retry delay.
    #[serde(with = "duration_millis")]
    pub backoff_jitter: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: DEFAULT_LEASE,
            watchdog_interval: None,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(500),
            backoff_jitter: Duration::from_millis(50),
        }
    }
}

impl LockConfig {
    /// Create a builder.
    pub fn builder() -> LockConfigBuilder {
        LockConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> LockConfigBuilder {
        let mut builder = LockConfigBuilder::new();

        if let Some(lease) = env_millis("ARMATURE_LOCK_LEASE_MS") {
            builder = builder.lease(lease);
        }

        if let Some(interval) = env_millis("ARMATURE_LOCK_WATCHDOG_INTERVAL_MS") {
            builder = builder.watchdog_interval(interval);
        }

        if let Some(initial) = env_millis("ARMATURE_LOCK_BACKOFF_INITIAL_MS") {
            builder = builder.initial_backoff(initial);
        }

        if let Some(max) = env_millis("ARMATURE_LOCK_BACKOFF_MAX_MS") {
            builder = builder.max_backoff(max);
        }

        if let Some(jitter) = env_millis("ARMATURE_LOCK_BACKOFF_JITTER_MS") {
            builder = builder.backoff_jitter(jitter);
        }

        builder
    }

    /// Effective watchdog period.
    pub fn watchdog_period(&self) -> Duration {
        self.watchdog_interval.unwrap_or(self.lease / 3)
    }

    /// How far past "now" each renewal pushes the store expiry.
    pub fn renewal_extension(&self) -> Duration {
        self.lease.saturating_mul(4) / 3
    }

    /// Check the configuration for values the lock algorithm cannot work with.
    pub fn validate(&self) -> LockResult<()> {
        if self.lease.is_zero() {
            return Err(LockError::config("lease must be greater than zero"));
        }

        let period = self.watchdog_period();
        if period.is_zero() || period >= self.lease {
            return Err(LockError::config(format!(
                "watchdog interval {:?} must be non-zero and shorter than the lease {:?}",
                period, self.lease
            )));
        }

        if self.initial_backoff.is_zero() {
            return Err(LockError::config("initial backoff must be greater than zero"));
        }

        if self.max_backoff < self.initial_backoff {
            return Err(LockError::config(format!(
                "max backoff {:?} is below the initial backoff {:?}",
                self.max_backoff, self.initial_backoff
            )));
        }

        Ok(())
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Builder for lock configuration.
#[derive(Default)]
pub struct LockConfigBuilder {
    config: LockConfig,
}

impl LockConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: LockConfig::default(),
        }
    }

    /// Set the lease used for renewable locks.
    pub fn lease(mut self, lease: Duration) -> Self {
        self.config.lease = lease;
        self
    }

    /// Set the watchdog period explicitly.
    pub fn watchdog_interval(mut self, interval: Duration) -> Self {
        self.config.watchdog_interval = Some(interval);
        self
    }

    /// Set the first retry delay.
    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.config.initial_backoff = backoff;
        self
    }

    /// Set the retry delay cap.
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.config.max_backoff = backoff;
        self
    }

    /// Set the retry jitter.
    pub fn backoff_jitter(mut self, jitter: Duration) -> Self {
        self.config.backoff_jitter = jitter;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> LockConfig {
        self.config
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serialize, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            duration.map(|d| d.as_millis() as u64).serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let millis = Option::<u64>::deserialize(deserializer)?;
            Ok(millis.map(Duration::from_millis))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LockConfig::default();
        assert_eq!(config.lease, Duration::from_secs(30));
        assert_eq!(config.watchdog_period(), Duration::from_secs(10));
        assert_eq!(config.renewal_extension(), Duration::from_secs(40));
        assert_eq!(config.initial_backoff, Duration::from_millis(50));
        assert_eq!(config.max_backoff, Duration::from_millis(500));
        assert_eq!(config.backoff_jitter, Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_watchdog_follows_lease() {
        let config = LockConfig::builder().lease(Duration::from_millis(300)).build();
        assert_eq!(config.watchdog_period(), Duration::from_millis(100));
        assert_eq!(config.renewal_extension(), Duration::from_millis(400));
    }

    #[test]
    fn test_explicit_watchdog_interval() {
        let config = LockConfig::builder()
            .lease(Duration::from_secs(9))
            .watchdog_interval(Duration::from_secs(1))
            .build();
        assert_eq!(config.watchdog_period(), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero_lease = LockConfig::builder().lease(Duration::ZERO).build();
        assert!(matches!(zero_lease.validate(), Err(LockError::Config(_))));

        let slow_watchdog = LockConfig::builder()
            .lease(Duration::from_secs(1))
            .watchdog_interval(Duration::from_secs(2))
            .build();
        assert!(matches!(slow_watchdog.validate(), Err(LockError::Config(_))));

        let inverted_backoff = LockConfig::builder()
            .initial_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_millis(10))
            .build();
        assert!(matches!(inverted_backoff.validate(), Err(LockError::Config(_))));
    }

    #[test]
    fn test_serde_millis() {
        let config: LockConfig = serde_json::from_str(r#"{"lease": 1500}"#).unwrap();
        assert_eq!(config.lease, Duration::from_millis(1500));
        assert_eq!(config.watchdog_interval, None);
        assert_eq!(config.max_backoff, Duration::from_millis(500));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["lease"], 1500);
        assert_eq!(json["initial_backoff"], 50);
    }
}
