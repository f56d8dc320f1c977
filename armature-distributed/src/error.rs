//! Lock error types.

use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Distributed lock errors
#[derive(Debug, Error)]
pub enum LockError {
    /// A key or token was blank.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not allowed for this lock (e.g. reentry on a fixed lease).
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The backing store could not be reached or rejected the command.
    #[error("Lock store error: {0}")]
    Store(String),

    /// Redis client error.
    #[error("Redis error: {0}")]
    Redis(#[from] armature_redis::RedisError),

    /// Invalid lock configuration.
    #[error("Lock configuration error: {0}")]
    Config(String),

    /// The lock manager has been shut down.
    #[error("Lock manager is shut down")]
    ShutDown,
}

impl LockError {
    /// Create an invalid argument error
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create a store error
    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the failure came from the store and may clear up on retry.
    ///
    /// Transient errors are absorbed by the acquisition loop and the watchdog;
    /// the rest surface to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Redis(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(LockError::store("connection reset").is_transient());
        assert!(LockError::Redis(armature_redis::RedisError::Timeout).is_transient());
        assert!(!LockError::invalid_argument("blank key").is_transient());
        assert!(!LockError::unsupported("reentry").is_transient());
        assert!(!LockError::ShutDown.is_transient());
    }

    #[test]
    fn test_display() {
        let err = LockError::invalid_argument("lock key must not be blank");
        assert_eq!(err.to_string(), "Invalid argument: lock key must not be blank");
    }
}
