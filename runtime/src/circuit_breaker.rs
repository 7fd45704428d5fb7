//! Failure-rate circuit breaker.
//!
//! The breaker watches the outcomes of recent calls and "opens" (refuses calls) when
//! the failure rate over a sliding window crosses a threshold.
//!
//! # States
//!
//! - **Closed**: Calls pass through. Outcomes are recorded in the window.
//! - **Open**: Calls are refused until `open_duration` has elapsed.
//! - **HalfOpen**: Up to `half_open_probes` concurrent probe calls are allowed. A probe
//!   failure reopens the circuit; once every probe slot has succeeded it closes.
//!
//! Admission and recording are split ([`CircuitBreaker::try_acquire`] and
//! [`CircuitBreaker::record`]) so the breaker can guard work whose completion is
//! reported later, as the backpressure controller does. [`CircuitBreaker::call`]
//! wraps both around a single async operation.
//!
//! # Example
//!
//! ```rust
//! use sagaflow_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = CircuitBreakerConfig::builder()
//!     .window_size(20)
//!     .min_calls(5)
//!     .failure_rate_threshold(0.5)
//!     .open_duration(Duration::from_secs(30))
//!     .build();
//!
//! let breaker = CircuitBreaker::new(config);
//!
//! match breaker.call(|| async { Ok::<_, String>(42) }).await {
//!     Ok(result) => println!("Success: {result}"),
//!     Err(e) => println!("Failed: {e}"),
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of recent outcomes considered
    pub window_size: usize,
    /// Outcomes required in the window before the rate is evaluated
    pub min_calls: usize,
    /// Failure rate (0.0 to 1.0) at or above which the circuit opens
    pub failure_rate_threshold: f64,
    /// How long the circuit stays open before probing
    pub open_duration: Duration,
    /// Concurrent probe calls allowed while half-open
    pub half_open_probes: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            min_calls: 10,
            failure_rate_threshold: 0.5,
            open_duration: Duration::from_secs(30),
            half_open_probes: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            window_size: None,
            min_calls: None,
            failure_rate_threshold: None,
            open_duration: None,
            half_open_probes: None,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    window_size: Option<usize>,
    min_calls: Option<usize>,
    failure_rate_threshold: Option<f64>,
    open_duration: Option<Duration>,
    half_open_probes: Option<usize>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the sliding window size.
    #[must_use]
    pub const fn window_size(mut self, size: usize) -> Self {
        self.window_size = Some(size);
        self
    }

    /// Set the minimum number of calls before the failure rate is evaluated.
    #[must_use]
    pub const fn min_calls(mut self, calls: usize) -> Self {
        self.min_calls = Some(calls);
        self
    }

    /// Set the failure rate threshold.
    #[must_use]
    pub const fn failure_rate_threshold(mut self, rate: f64) -> Self {
        self.failure_rate_threshold = Some(rate);
        self
    }

    /// Set how long the circuit stays open.
    #[must_use]
    pub const fn open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = Some(duration);
        self
    }

    /// Set the number of concurrent half-open probes.
    #[must_use]
    pub const fn half_open_probes(mut self, probes: usize) -> Self {
        self.half_open_probes = Some(probes);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        let defaults = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            window_size: self.window_size.unwrap_or(defaults.window_size).max(1),
            min_calls: self.min_calls.unwrap_or(defaults.min_calls).max(1),
            failure_rate_threshold: self
                .failure_rate_threshold
                .unwrap_or(defaults.failure_rate_threshold),
            open_duration: self.open_duration.unwrap_or(defaults.open_duration),
            half_open_probes: self.half_open_probes.unwrap_or(defaults.half_open_probes).max(1),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Circuit is closed, calls pass through normally
    Closed,
    /// Circuit is open, calls are refused
    Open,
    /// Circuit is half-open, probing for recovery
    HalfOpen,
}

impl State {
    /// Gauge value: 0 = closed, 1 = half-open, 2 = open.
    #[must_use]
    pub const fn as_gauge(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

/// The circuit refused a call.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Circuit breaker is open")]
pub struct CircuitOpen;

/// Errors from [`CircuitBreaker::call`].
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, request rejected
    #[error("Circuit breaker is open")]
    Open,
    /// Operation failed
    #[error("Operation failed: {0}")]
    Inner(E),
}

/// Ticket for an admitted call; hand it back to [`CircuitBreaker::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "an admitted call must be recorded"]
pub struct Admission {
    probe: bool,
}

impl Admission {
    /// Rebuild a ticket that crossed an API boundary, such as a backpressure permit.
    pub const fn new(probe: bool) -> Self {
        Self { probe }
    }

    /// Whether the call was admitted as a half-open probe.
    #[must_use]
    pub const fn is_probe(self) -> bool {
        self.probe
    }
}

#[derive(Debug)]
struct Inner {
    state: State,
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    probes_in_flight: usize,
    probe_successes: usize,
}

/// Failure-rate circuit breaker.
///
/// Cloning shares the underlying state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<Mutex<Inner>>,
    // Metrics
    total_calls: Arc<AtomicU64>,
    total_successes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: State::Closed,
                window: VecDeque::with_capacity(config.window_size),
                opened_at: None,
                probes_in_flight: 0,
                probe_successes: 0,
            })),
            config: Arc::new(config),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker.
    ///
    /// An open circuit whose `open_duration` elapsed reports `HalfOpen`.
    #[must_use]
    pub fn state(&self) -> State {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.refresh(&mut inner);
        inner.state
    }

    /// Ask to make a call.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitOpen`] while the circuit is open, or while half-open with
    /// every probe slot taken.
    pub fn try_acquire(&self) -> Result<Admission, CircuitOpen> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.refresh(&mut inner);

        match inner.state {
            State::Closed => Ok(Admission { probe: false }),
            State::HalfOpen if inner.probes_in_flight < self.config.half_open_probes => {
                inner.probes_in_flight += 1;
                Ok(Admission { probe: true })
            }
            State::HalfOpen | State::Open => {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                Err(CircuitOpen)
            }
        }
    }

    /// Record the outcome of an admitted call.
    pub fn record(&self, admission: Admission, success: bool) {
        if success {
            self.total_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
        }

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if admission.probe {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
            if inner.state != State::HalfOpen {
                return;
            }
            if success {
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.half_open_probes {
                    tracing::info!(
                        successes = inner.probe_successes,
                        "Circuit breaker transitioning HALF_OPEN -> CLOSED"
                    );
                    inner.state = State::Closed;
                    inner.window.clear();
                    inner.opened_at = None;
                    inner.probe_successes = 0;
                }
            } else {
                tracing::warn!("Circuit breaker transitioning HALF_OPEN -> OPEN (probe failed)");
                Self::open(&mut inner);
            }
            return;
        }

        if inner.state != State::Closed {
            return;
        }

        if inner.window.len() == self.config.window_size {
            inner.window.pop_front();
        }
        inner.window.push_back(success);

        if inner.window.len() >= self.config.min_calls {
            let rate = failure_rate(&inner.window);
            if rate >= self.config.failure_rate_threshold {
                tracing::warn!(
                    failure_rate = rate,
                    threshold = self.config.failure_rate_threshold,
                    "Circuit breaker transitioning CLOSED -> OPEN"
                );
                Self::open(&mut inner);
            }
        }
    }

    /// Call an operation through the circuit breaker.
    ///
    /// # Errors
    ///
    /// Returns `CircuitBreakerError::Open` if the circuit is open.
    /// Returns `CircuitBreakerError::Inner` if the operation fails.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let Ok(admission) = self.try_acquire() else {
            tracing::warn!("Circuit breaker is OPEN, rejecting request");
            return Err(CircuitBreakerError::Open);
        };

        match operation().await {
            Ok(result) => {
                self.record(admission, true);
                Ok(result)
            }
            Err(err) => {
                self.record(admission, false);
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    /// Get circuit breaker metrics.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::info!("Circuit breaker manually reset to CLOSED");
        inner.state = State::Closed;
        inner.window.clear();
        inner.opened_at = None;
        inner.probes_in_flight = 0;
        inner.probe_successes = 0;
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state != State::Open {
            return;
        }
        let elapsed = inner
            .opened_at
            .is_none_or(|at| at.elapsed() >= self.config.open_duration);
        if elapsed {
            tracing::info!("Circuit breaker transitioning OPEN -> HALF_OPEN");
            inner.state = State::HalfOpen;
            inner.probes_in_flight = 0;
            inner.probe_successes = 0;
        }
    }

    fn open(inner: &mut Inner) {
        inner.state = State::Open;
        inner.opened_at = Some(Instant::now());
        inner.window.clear();
        inner.probe_successes = 0;
    }
}

#[allow(clippy::cast_precision_loss)]
fn failure_rate(window: &VecDeque<bool>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let failures = window.iter().filter(|ok| !**ok).count();
    failures as f64 / window.len() as f64
}

/// Metrics for circuit breaker monitoring.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerMetrics {
    /// Total number of calls attempted
    pub total_calls: u64,
    /// Total number of successful calls
    pub total_successes: u64,
    /// Total number of failed calls
    pub total_failures: u64,
    /// Total number of rejected calls (circuit open)
    pub total_rejections: u64,
}

impl CircuitBreakerMetrics {
    /// Calculate success rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 1.0;
        }
        self.total_successes as f64 / self.total_calls as f64
    }

    /// Calculate rejection rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_rejections as f64 / self.total_calls as f64
    }
}
