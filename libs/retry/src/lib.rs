//! Bounded retry primitive.
//!
//! Host start and cluster health checks poll an external subsystem until it
//! reports success. Each call site supplies an attempt closure plus a fixed
//! [`RetryBudget`]; the closure tags every failure as either retriable or
//! fatal, and [`retry`] inspects that tag instead of a wrapped sentinel type.
//!
//! # Invariants
//!
//! - At most `budget.attempts` calls are made.
//! - The delay is fixed; there is no exponential backoff.
//! - No sleep follows the final attempt.
//! - A fatal failure stops the loop immediately.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Outcome tag for a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError<E> {
    /// Transient failure; try again after the delay.
    Retriable(E),

    /// Permanent failure; stop retrying.
    Fatal(E),
}

impl<E> AttemptError<E> {
    /// Returns true if another attempt may be made.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Retriable(_))
    }

    /// Unwrap the underlying error.
    pub fn into_inner(self) -> E {
        match self {
            Self::Retriable(e) | Self::Fatal(e) => e,
        }
    }
}

/// Result of one attempt.
pub type AttemptResult<T, E> = Result<T, AttemptError<E>>;

/// Tagging helpers for plain results.
pub trait ResultExt<T, E> {
    /// Tag any error as retriable.
    fn retriable(self) -> AttemptResult<T, E>;

    /// Tag any error as fatal.
    fn fatal(self) -> AttemptResult<T, E>;
}

impl<T, E> ResultExt<T, E> for Result<T, E> {
    fn retriable(self) -> AttemptResult<T, E> {
        self.map_err(AttemptError::Retriable)
    }

    fn fatal(self) -> AttemptResult<T, E> {
        self.map_err(AttemptError::Fatal)
    }
}

/// Attempt count and fixed delay for one call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    /// Maximum number of attempts.
    pub attempts: u32,

    /// Delay between consecutive attempts.
    pub delay: Duration,
}

impl RetryBudget {
    /// Create a budget.
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Worst-case time spent sleeping between attempts.
    pub fn max_wait(&self) -> Duration {
        self.delay * self.attempts.saturating_sub(1)
    }
}

impl fmt::Display for RetryBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} attempts every {:?}", self.attempts, self.delay)
    }
}

/// Why a retry loop gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retriable error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// An attempt failed with a fatal error.
    #[error("aborted on attempt {attempt}: {error}")]
    Aborted { attempt: u32, error: E },

    /// The budget allowed zero attempts.
    #[error("retry budget allows no attempts")]
    NoAttempts,
}

impl<E> RetryError<E> {
    /// The last observed error, if any attempt ran.
    pub fn into_last(self) -> Option<E> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::Aborted { error, .. } => Some(error),
            Self::NoAttempts => None,
        }
    }
}

/// Run `attempt` until it succeeds, fails fatally, or the budget runs out.
///
/// Blocks the calling task for up to `budget.max_wait()` plus the time spent
/// inside the attempts themselves. There is no cancellation hook.
pub async fn retry<T, E, F, Fut>(budget: RetryBudget, mut attempt: F) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AttemptResult<T, E>>,
    E: fmt::Display,
{
    let mut last = None;

    for n in 1..=budget.attempts {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(AttemptError::Fatal(error)) => {
                debug!(attempt = n, error = %error, "Attempt failed fatally");
                return Err(RetryError::Aborted { attempt: n, error });
            }
            Err(AttemptError::Retriable(error)) => {
                debug!(
                    attempt = n,
                    max_attempts = budget.attempts,
                    error = %error,
                    "Attempt failed, will retry"
                );
                last = Some(error);
            }
        }

        if n < budget.attempts {
            tokio::time::sleep(budget.delay).await;
        }
    }

    match last {
        Some(last) => Err(RetryError::Exhausted {
            attempts: budget.attempts,
            last,
        }),
        None => Err(RetryError::NoAttempts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Attempt closure that fails `failures` times, then succeeds.
    fn flaky(
        failures: u32,
    ) -> (
        Arc<AtomicU32>,
        impl FnMut() -> std::future::Ready<AttemptResult<u32, String>>,
    ) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let f = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            std::future::ready(if n <= failures {
                Err(AttemptError::Retriable(format!("failure {}", n)))
            } else {
                Ok(n)
            })
        };
        (calls, f)
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_within_budget() {
        let (calls, f) = flaky(4);
        let result = retry(RetryBudget::new(5, Duration::from_secs(2)), f).await;

        assert_eq!(result.unwrap(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_with_last_error() {
        let (calls, f) = flaky(4);
        let result = retry(RetryBudget::new(4, Duration::from_secs(2)), f).await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 4);
                assert_eq!(last, "failure 4");
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(RetryBudget::new(10, Duration::from_secs(1)), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AttemptError::Fatal("no such machine")) }
        })
        .await;

        assert!(matches!(
            result,
            Err(RetryError::Aborted { attempt: 1, error: "no such machine" })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_sleep_after_last_attempt() {
        let start = tokio::time::Instant::now();
        let (_, f) = flaky(u32::MAX);
        let budget = RetryBudget::new(3, Duration::from_secs(10));
        let _ = retry(budget, f).await;

        assert_eq!(start.elapsed(), budget.max_wait());
        assert_eq!(budget.max_wait(), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_zero_budget() {
        let (calls, f) = flaky(0);
        let result = retry(RetryBudget::new(0, Duration::ZERO), f).await;

        assert!(matches!(result, Err(RetryError::NoAttempts)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_result_ext_tags() {
        let err: Result<(), &str> = Err("boom");
        assert!(err.retriable().unwrap_err().is_retriable());
        assert!(!err.fatal().unwrap_err().is_retriable());
        assert_eq!(AttemptError::Fatal("x").into_inner(), "x");
    }
}
