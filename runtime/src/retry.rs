//! Retry logic with exponential backoff and jitter.
//!
//! The policy itself ([`RetryPolicy`]) is plain data defined in `sagaflow-core`. This
//! module turns it into waiting: [`backoff_delay`] adds jitter to the deterministic
//! schedule, and [`retry_with_backoff`] / [`retry_with_predicate`] drive an async
//! operation through the schedule.
//!
//! # Example
//!
//! ```rust
//! use sagaflow_runtime::retry::retry_with_backoff;
//! use sagaflow_core::RetryPolicy;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::new()
//!     .with_max_attempts(5)
//!     .with_base_delay(Duration::from_millis(100))
//!     .with_jitter(false);
//!
//! let (value, attempts) = retry_with_backoff(&policy, |_attempt| async {
//!     Ok::<_, String>(42)
//! })
//! .await
//! .map_err(|exhausted| exhausted.error)?;
//!
//! assert_eq!((value, attempts), (42, 1));
//! # Ok(())
//! # }
//! ```

use rand::Rng;
use sagaflow_core::RetryPolicy;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// The operation kept failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted<E> {
    /// Error from the last attempt
    pub error: E,
    /// Attempts made, including the first
    pub attempts: u32,
}

/// Delay to wait after failed attempt `failed_attempt` (1-based).
///
/// `base * 2^(n-1)` capped at the policy's maximum, plus a uniformly random extra
/// in `[0, delay)` when jitter is enabled.
#[must_use]
pub fn backoff_delay(policy: &RetryPolicy, failed_attempt: u32) -> Duration {
    let delay = policy.backoff_for(failed_attempt);
    if !policy.jitter() || delay.is_zero() {
        return delay;
    }

    #[allow(clippy::cast_possible_truncation)] // delays never approach u64::MAX nanoseconds
    let bound = delay.as_nanos().min(u128::from(u64::MAX)) as u64;
    let extra = rand::thread_rng().gen_range(0..bound);
    delay + Duration::from_nanos(extra)
}

/// Retry an async operation with exponential backoff.
///
/// The operation receives the 1-based attempt number.
///
/// # Errors
///
/// Returns [`Exhausted`] with the last error once the policy's attempts are spent.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation: F,
) -> Result<(T, u32), Exhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_predicate(policy, operation, |_| true).await
}

/// Retry an async operation, consulting `is_retryable` before every retry.
///
/// On success returns the value together with the number of attempts it took.
///
/// # Errors
///
/// Returns [`Exhausted`] with the last error once the attempts are spent or the
/// predicate rejects an error.
///
/// # Example
///
/// ```rust
/// use sagaflow_runtime::retry::retry_with_predicate;
/// use sagaflow_core::RetryPolicy;
///
/// # async fn example() {
/// let result = retry_with_predicate(
///     &RetryPolicy::new(),
///     |_attempt| async { Err::<i32, _>("permanent error") },
///     |err: &&str| err.contains("transient"),
/// )
/// .await;
///
/// assert_eq!(result.unwrap_err().attempts, 1);
/// # }
/// ```
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    operation: F,
    is_retryable: P,
) -> Result<(T, u32), Exhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    retry_while(policy, operation, is_retryable, || true).await
}

/// Retry an async operation while `proceed` allows it.
///
/// `proceed` is checked after every backoff sleep, right before the next attempt
/// would start. When it returns `false` the last error is returned without
/// invoking the operation again.
///
/// # Errors
///
/// Returns [`Exhausted`] with the last error once the attempts are spent, the
/// predicate rejects an error, or `proceed` stops the loop.
pub async fn retry_while<F, Fut, T, E, P, C>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
    proceed: C,
) -> Result<(T, u32), Exhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
    C: Fn() -> bool,
{
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(attempt, "Operation succeeded after retry");
                }
                return Ok((result, attempt));
            }
            Err(err) => {
                if !is_retryable(&err) {
                    tracing::debug!(attempt, error = %err, "Error is not retryable, failing immediately");
                    return Err(Exhausted {
                        error: err,
                        attempts: attempt,
                    });
                }

                if !policy.should_retry(attempt) {
                    tracing::debug!(attempt, error = %err, "Operation failed after max attempts");
                    metrics::counter!("retry.exhausted").increment(1);
                    return Err(Exhausted {
                        error: err,
                        attempts: attempt,
                    });
                }

                let delay = backoff_delay(policy, attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying..."
                );
                metrics::counter!("retry.attempts").increment(1);

                sleep(delay).await;
                if !proceed() {
                    tracing::debug!(attempt, error = %err, "Retry abandoned after backoff");
                    return Err(Exhausted {
                        error: err,
                        attempts: attempt,
                    });
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_without_jitter_follows_schedule() {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_millis(100))
            .with_jitter(false);

        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_stays_below_double() {
        let policy = RetryPolicy::new().with_base_delay(Duration::from_millis(100));

        for _ in 0..100 {
            let delay = backoff_delay(&policy, 2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay < Duration::from_millis(400));
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_first_try() {
        let counter = Arc::new(AtomicU32::new(0));

        let result = retry_with_backoff(&RetryPolicy::new(), |_| {
            let c = Arc::clone(&counter);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(42)
            }
        })
        .await;

        assert_eq!(result, Ok((42, 1)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let policy = RetryPolicy::new()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(10));

        let result = retry_with_backoff(&policy, |attempt| async move {
            if attempt < 3 {
                Err(format!("Attempt {attempt} failed"))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result, Ok((42, 3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_attempts() {
        let policy = RetryPolicy::new()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_millis(10));

        let result = retry_with_backoff(&policy, |_| async { Err::<i32, _>("Persistent failure") }).await;

        assert_eq!(
            result,
            Err(Exhausted {
                error: "Persistent failure",
                attempts: 3
            })
        );
    }

    #[tokio::test]
    async fn test_retry_with_predicate_skips_non_retryable() {
        let counter = Arc::new(AtomicU32::new(0));

        let result = retry_with_predicate(
            &RetryPolicy::new(),
            |_| {
                let c = Arc::clone(&counter);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>("permanent error")
                }
            },
            |err: &&str| err.contains("transient"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_while_stops_when_abandoned_during_backoff() {
        let policy = RetryPolicy::new()
            .with_max_attempts(3)
            .with_base_delay(Duration::from_secs(1))
            .with_jitter(false);
        let counter = Arc::new(AtomicU32::new(0));
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let stopper = {
            let stop = Arc::clone(&stop);
            tokio::spawn(async move {
                sleep(Duration::from_millis(10)).await;
                stop.store(true, Ordering::SeqCst);
            })
        };

        let result = retry_while(
            &policy,
            |_| {
                let c = Arc::clone(&counter);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>("transient")
                }
            },
            |_| !stop.load(Ordering::SeqCst),
            || !stop.load(Ordering::SeqCst),
        )
        .await;
        stopper.await.unwrap();

        assert_eq!(
            result,
            Err(Exhausted {
                error: "transient",
                attempts: 1
            })
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
