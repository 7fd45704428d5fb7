//! Retry policy description for steps, participants and compensations.
//!
//! This is the data half of retrying: the policy attached to a definition and the
//! deterministic exponential schedule derived from it. Jitter and the actual waiting
//! are applied by the runtime (`sagaflow_runtime::retry`).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy configuration for exponential backoff.
///
/// The delay before attempt `n + 1` (after attempt `n` failed) is
/// `base_delay * 2^(n - 1)`, capped at `max_delay`. When `jitter` is enabled the
/// runtime adds a uniformly random extra delay in `[0, delay)`.
///
/// # Default Values
///
/// - `max_attempts`: 3 (including the first attempt)
/// - `base_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `jitter`: true
///
/// # Example
///
/// ```
/// use sagaflow_core::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new()
///     .with_max_attempts(3)
///     .with_base_delay(Duration::from_millis(100))
///     .with_jitter(false);
///
/// assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
/// assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt)
    max_attempts: u32,

    /// Delay after the first failed attempt
    base_delay: Duration,

    /// Cap for the exponential schedule
    max_delay: Duration,

    /// Whether random jitter is added to each delay
    jitter: bool,
}

impl RetryPolicy {
    /// Create a new retry policy with default settings
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }

    /// A policy that makes exactly one attempt.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self::new().with_max_attempts(1)
    }

    /// Set maximum attempts (values below 1 are treated as 1)
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = if attempts == 0 { 1 } else { attempts };
        self
    }

    /// Set the delay after the first failed attempt
    #[must_use]
    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the cap for the exponential schedule
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable jitter
    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Get maximum number of attempts
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Get the base delay
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Get the delay cap
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Whether jitter is enabled
    #[must_use]
    pub const fn jitter(&self) -> bool {
        self.jitter
    }

    /// Check if another attempt is allowed after `attempts_made` attempts
    #[must_use]
    pub const fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Deterministic delay to wait after the failed attempt number `failed_attempt`
    /// (1-based), before jitter.
    ///
    /// `delay = min(base_delay * 2^(failed_attempt - 1), max_delay)`
    #[must_use]
    pub fn backoff_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_schedule() {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(10));

        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(800));
    }

    #[test]
    fn test_schedule_is_capped() {
        let policy = RetryPolicy::new()
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(2));

        assert_eq!(policy.backoff_for(40), Duration::from_secs(2));
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        let policy = RetryPolicy::new().with_max_attempts(0);
        assert_eq!(policy.max_attempts(), 1);
        assert!(policy.should_retry(0));
        assert!(!policy.should_retry(1));
    }
}
