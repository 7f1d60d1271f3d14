//! Bounded retries around a store operation.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (first try included).
//! - Every attempt runs under its own timeout, shortened to whatever is left of the
//!   caller's deadline when one is given.
//! - Transient failures (see [`StoreError::is_transient`]) consume an attempt and the next
//!   one starts immediately; anything else stops the loop.
//! - An abandoned attempt's partial work is never reused.
//! - Callers retry the same request (same score, same member). If an attempt that timed
//!   out did reach the store, the retry counts that request's own entry, so the count
//!   comes out one higher than the true pre-insert count.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use crate::error::{RetryError, StoreError};

pub const DEFAULT_MAX_ATTEMPTS: usize = 3;
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: usize,
    attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempt_timeout,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.attempt_timeout
    }

    /// Worst-case time spent in [`execute`](Self::execute) without a caller deadline.
    pub fn worst_case(&self) -> Duration {
        self.attempt_timeout * self.max_attempts as u32
    }

    /// Run `op` until it succeeds, fails for good, or the attempts run out.
    pub async fn execute<T, F, Fut>(
        &self,
        deadline: Option<Instant>,
        mut op: F,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut last = StoreError::DeadlineExceeded;

        for attempt in 1..=self.max_attempts {
            let timeout = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(RetryError::Exhausted {
                            attempts: attempt - 1,
                            last,
                        });
                    }
                    remaining.min(self.attempt_timeout)
                }
                None => self.attempt_timeout,
            };

            let err = match tokio::time::timeout(timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_) => StoreError::AttemptTimeout(timeout),
            };

            if !err.is_transient() {
                return Err(RetryError::Fatal {
                    attempts: attempt,
                    source: err,
                });
            }

            warn!(
                attempt = attempt,
                max_attempts = self.max_attempts,
                error = %err,
                "Store attempt failed, retrying"
            );
            last = err;
        }

        Err(RetryError::Exhausted {
            attempts: self.max_attempts,
            last,
        })
    }
}
