//! Bounded retries with exponential backoff

use std::{fmt, future::Future, time::Duration};

use thiserror::Error;
use tracing::{debug, warn};

/// Errors that may succeed when retried.
pub trait Transient {
    /// Whether retrying the failed call might succeed.
    fn is_transient(&self) -> bool;
}

/// Failure of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a transient error.
    #[error("{operation} failed after {attempts} attempts")]
    Exhausted {
        /// Operation label.
        operation: &'static str,

        /// Attempts made.
        attempts: u32,

        /// Error from the final attempt.
        #[source]
        last: E,
    },

    /// The operation failed with an error that is not worth retrying.
    #[error(transparent)]
    Permanent(E),
}

impl<E> RetryError<E> {
    /// Borrow the underlying error.
    pub const fn inner(&self) -> &E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Permanent(error) => error,
        }
    }

    /// Unwrap the underlying error.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Permanent(error) => error,
        }
    }
}

/// Attempt budget and backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    /// New policy; `attempts` is clamped to at least one.
    #[must_use]
    pub fn new(attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Policy that tries once and never sleeps.
    #[must_use]
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Maximum number of attempts.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay after the given failed attempt (1-based), doubling each time up to the cap.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));

        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails permanently or runs out of attempts.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Permanent`] for the first non-transient error, otherwise
    /// [`RetryError::Exhausted`] once the attempt budget is spent.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Transient + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if !error.is_transient() => return Err(RetryError::Permanent(error)),
                Err(error) if attempt >= self.attempts => {
                    warn!(operation, attempts = attempt, %error, "retries exhausted");

                    return Err(RetryError::Exhausted {
                        operation,
                        attempts: attempt,
                        last: error,
                    });
                }
                Err(error) => {
                    let delay = self.delay_for(attempt);

                    debug!(operation, attempt, ?delay, %error, "transient failure, retrying");

                    tokio::time::sleep(delay).await;

                    attempt += 1;
                }
            }
        }
    }
}
