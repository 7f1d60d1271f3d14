//! Error types for Flow Guard.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Flow Guard operations.
#[derive(Error, Debug)]
pub enum FlowGuardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shared store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Flow Guard operations.
pub type Result<T> = std::result::Result<T, FlowGuardError>;

/// A failure talking to the shared store, classified by how the limiter reacts to it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A single attempt ran past its own timeout
    #[error("store attempt timed out after {0:?}")]
    AttemptTimeout(Duration),

    /// The caller's deadline passed before another attempt could start
    #[error("caller deadline exceeded")]
    DeadlineExceeded,

    /// Transport-level timeout reported by the driver
    #[error("store timeout: {0}")]
    Timeout(String),

    /// The store refused the connection
    #[error("store connection refused: {0}")]
    ConnectionRefused(String),

    /// The connection closed unexpectedly (EOF, reset, broken pipe)
    #[error("store connection closed: {0}")]
    ConnectionClosed(String),

    /// The store asked the client to try again
    #[error("store asked to try again: {0}")]
    TryAgain(String),

    /// The store answered with something other than the expected reply shape
    #[error("unexpected store response: {0}")]
    UnexpectedResponse(String),

    /// Any other store failure
    #[error("store failure: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether the failure is worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::AttemptTimeout(_)
                | StoreError::DeadlineExceeded
                | StoreError::Timeout(_)
                | StoreError::ConnectionRefused(_)
                | StoreError::ConnectionClosed(_)
                | StoreError::TryAgain(_)
        )
    }

    /// Whether the store replied, but with a shape the limiter cannot decode.
    pub fn is_protocol(&self) -> bool {
        matches!(self, StoreError::UnexpectedResponse(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        let message = err.to_string();

        if err.is_timeout() {
            return StoreError::Timeout(message);
        }
        if err.is_connection_refusal() {
            return StoreError::ConnectionRefused(message);
        }
        if err.is_connection_dropped() || message.contains("EOF") {
            return StoreError::ConnectionClosed(message);
        }

        match err.kind() {
            redis::ErrorKind::TryAgain => StoreError::TryAgain(message),
            redis::ErrorKind::TypeError => StoreError::UnexpectedResponse(message),
            _ => StoreError::Backend(message),
        }
    }
}

/// Outcome of a retried store operation that did not produce a value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// Every attempt failed with a transient error, or the caller's deadline ran out
    #[error("store unavailable after {attempts} attempt(s): {last}")]
    Exhausted { attempts: usize, last: StoreError },

    /// A failure that is not worth retrying
    #[error("store failed after {attempts} attempt(s): {source}")]
    Fatal { attempts: usize, source: StoreError },
}

impl RetryError {
    /// The underlying store error.
    pub fn store_error(&self) -> &StoreError {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Fatal { source, .. } => source,
        }
    }

    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Fatal { attempts, .. } => {
                *attempts
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::AttemptTimeout(Duration::from_secs(1)).is_transient());
        assert!(StoreError::DeadlineExceeded.is_transient());
        assert!(StoreError::Timeout("read".into()).is_transient());
        assert!(StoreError::ConnectionRefused("refused".into()).is_transient());
        assert!(StoreError::ConnectionClosed("EOF".into()).is_transient());
        assert!(StoreError::TryAgain("TRYAGAIN".into()).is_transient());

        assert!(!StoreError::UnexpectedResponse("nil".into()).is_transient());
        assert!(!StoreError::Backend("NOPERM".into()).is_transient());
    }

    #[test]
    fn test_redis_error_classification() {
        let refused = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(matches!(StoreError::from(refused), StoreError::ConnectionRefused(_)));

        let timeout = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out",
        ));
        assert!(matches!(StoreError::from(timeout), StoreError::Timeout(_)));

        let closed = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "unexpected EOF",
        ));
        assert!(matches!(StoreError::from(closed), StoreError::ConnectionClosed(_)));

        let try_again = redis::RedisError::from((redis::ErrorKind::TryAgain, "TRYAGAIN"));
        assert!(matches!(StoreError::from(try_again), StoreError::TryAgain(_)));

        let bad_type = redis::RedisError::from((redis::ErrorKind::TypeError, "not an int"));
        assert!(StoreError::from(bad_type).is_protocol());

        let other = redis::RedisError::from((redis::ErrorKind::ResponseError, "NOSCRIPT"));
        assert!(matches!(StoreError::from(other), StoreError::Backend(_)));
    }

    #[test]
    fn test_retry_error_accessors() {
        let err = RetryError::Exhausted {
            attempts: 3,
            last: StoreError::TryAgain("busy".into()),
        };
        assert_eq!(err.attempts(), 3);
        assert!(err.store_error().is_transient());
        assert!(err.to_string().contains("3 attempt(s)"));
    }
}
