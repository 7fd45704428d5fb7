//! Backpressure strategies.
//!
//! Each strategy implements the [`Backpressure`] port from `sagaflow-core`. All
//! admission checks and counter updates of one controller happen under a single
//! mutex, so concurrent submissions observe consistent limits.
//!
//! | Strategy | Admits | Adapts on |
//! |---|---|---|
//! | [`AdaptiveBackpressure`] | while in-flight < limit | error rate and latency (AIMD) |
//! | [`BatchedBackpressure`] | in groups of `batch_size` | nothing |
//! | [`CircuitBreakerBackpressure`] | while the breaker is closed | failure rate |
//! | [`UnboundedBackpressure`] | everything | nothing |

use crate::circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig};
use crate::config::ConfigError;
use sagaflow_core::BoxFuture;
use sagaflow_core::backpressure::{
    AdmissionOutcome, AdmissionPermit, Backpressure, BackpressureRejected,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

/// Closed set of strategies, selectable by name.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum BackpressureStrategy {
    /// AIMD concurrency limit
    Adaptive(AdaptiveConfig),
    /// Group submissions into batches
    Batched(BatchedConfig),
    /// Refuse submissions while failures dominate
    CircuitBreaker(CircuitBreakerConfig),
    /// Admit everything
    #[default]
    Unbounded,
}

impl BackpressureStrategy {
    /// Select a strategy with default settings by name.
    ///
    /// Names are case-insensitive; `-` and `_` are interchangeable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownStrategy`] for an unrecognized name.
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "adaptive" => Ok(Self::Adaptive(AdaptiveConfig::default())),
            "batched" | "batch" => Ok(Self::Batched(BatchedConfig::default())),
            "circuit_breaker" => Ok(Self::CircuitBreaker(CircuitBreakerConfig::default())),
            "unbounded" | "none" | "" => Ok(Self::Unbounded),
            _ => Err(ConfigError::UnknownStrategy(name.to_string())),
        }
    }

    /// Instantiate the controller.
    #[must_use]
    pub fn build(self) -> Arc<dyn Backpressure> {
        match self {
            Self::Adaptive(config) => Arc::new(AdaptiveBackpressure::new(config)),
            Self::Batched(config) => Arc::new(BatchedBackpressure::new(config)),
            Self::CircuitBreaker(config) => Arc::new(CircuitBreakerBackpressure::new(config)),
            Self::Unbounded => Arc::new(UnboundedBackpressure::default()),
        }
    }
}

/// Admits every submission.
#[derive(Debug, Default)]
pub struct UnboundedBackpressure {
    tickets: AtomicU64,
}

impl Backpressure for UnboundedBackpressure {
    fn admit<'a>(
        &'a self,
        definition: &'a str,
    ) -> BoxFuture<'a, Result<AdmissionPermit, BackpressureRejected>> {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        Box::pin(async move { Ok(AdmissionPermit::new(definition, ticket)) })
    }

    fn release(&self, _permit: AdmissionPermit, _outcome: AdmissionOutcome) {}

    fn name(&self) -> &'static str {
        "unbounded"
    }
}

/// Settings for [`AdaptiveBackpressure`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Starting concurrency limit
    pub initial_limit: usize,
    /// Floor for the limit
    pub min_limit: usize,
    /// Ceiling for the limit
    pub max_limit: usize,
    /// Latency above which the limit shrinks
    pub target_latency: Duration,
    /// Number of recent outcomes used for the error rate
    pub window_size: usize,
    /// Error rate above which the limit shrinks
    pub error_rate_threshold: f64,
    /// Multiplier applied on decrease (0.0 to 1.0)
    pub decrease_factor: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            initial_limit: 20,
            min_limit: 1,
            max_limit: 200,
            target_latency: Duration::from_secs(1),
            window_size: 50,
            error_rate_threshold: 0.1,
            decrease_factor: 0.5,
        }
    }
}

impl AdaptiveConfig {
    /// Set the starting limit
    #[must_use]
    pub const fn with_initial_limit(mut self, limit: usize) -> Self {
        self.initial_limit = limit;
        self
    }

    /// Set the limit bounds
    #[must_use]
    pub const fn with_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_limit = min;
        self.max_limit = max;
        self
    }

    /// Set the target latency
    #[must_use]
    pub const fn with_target_latency(mut self, latency: Duration) -> Self {
        self.target_latency = latency;
        self
    }

    /// Set the error-rate window size
    #[must_use]
    pub const fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = size;
        self
    }

    /// Set the error rate threshold
    #[must_use]
    pub const fn with_error_rate_threshold(mut self, threshold: f64) -> Self {
        self.error_rate_threshold = threshold;
        self
    }

    /// Set the decrease factor
    #[must_use]
    pub const fn with_decrease_factor(mut self, factor: f64) -> Self {
        self.decrease_factor = factor;
        self
    }
}

#[derive(Debug)]
struct AdaptiveState {
    limit: usize,
    in_flight: usize,
    window: VecDeque<bool>,
    tickets: u64,
}

/// Additive-increase / multiplicative-decrease concurrency limiter.
#[derive(Debug)]
pub struct AdaptiveBackpressure {
    config: AdaptiveConfig,
    state: Mutex<AdaptiveState>,
}

impl AdaptiveBackpressure {
    /// Create a limiter.
    #[must_use]
    pub fn new(config: AdaptiveConfig) -> Self {
        let min = config.min_limit.max(1);
        let max = config.max_limit.max(min);
        let config = AdaptiveConfig {
            min_limit: min,
            max_limit: max,
            window_size: config.window_size.max(1),
            ..config
        };
        Self {
            state: Mutex::new(AdaptiveState {
                limit: config.initial_limit.clamp(min, max),
                in_flight: 0,
                window: VecDeque::with_capacity(config.window_size),
                tickets: 0,
            }),
            config,
        }
    }

    /// Current concurrency limit.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).limit
    }

    /// Admitted executions not yet released.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).in_flight
    }
}

impl Backpressure for AdaptiveBackpressure {
    fn admit<'a>(
        &'a self,
        definition: &'a str,
    ) -> BoxFuture<'a, Result<AdmissionPermit, BackpressureRejected>> {
        let decision = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.in_flight < state.limit {
                state.in_flight += 1;
                state.tickets += 1;
                Ok(AdmissionPermit::new(definition, state.tickets))
            } else {
                Err(BackpressureRejected {
                    definition: definition.to_string(),
                    strategy: self.name(),
                    reason: format!("concurrency limit {} reached", state.limit),
                })
            }
        };
        Box::pin(async move { decision })
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn release(&self, _permit: AdmissionPermit, outcome: AdmissionOutcome) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_flight = state.in_flight.saturating_sub(1);

        if state.window.len() == self.config.window_size {
            state.window.pop_front();
        }
        state.window.push_back(outcome.success);

        let failures = state.window.iter().filter(|ok| !**ok).count();
        let error_rate = failures as f64 / state.window.len() as f64;
        let previous = state.limit;

        if error_rate > self.config.error_rate_threshold || outcome.latency > self.config.target_latency {
            let reduced = (state.limit as f64 * self.config.decrease_factor).floor() as usize;
            state.limit = reduced.max(self.config.min_limit);
        } else {
            state.limit = (state.limit + 1).min(self.config.max_limit);
        }

        if state.limit != previous {
            tracing::debug!(
                previous,
                limit = state.limit,
                error_rate,
                latency_ms = outcome.latency.as_millis(),
                "Adaptive backpressure limit changed"
            );
            metrics::gauge!("backpressure.adaptive.limit").set(state.limit as f64);
        }
    }

    fn name(&self) -> &'static str {
        "adaptive"
    }
}

/// Settings for [`BatchedBackpressure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchedConfig {
    /// Submissions released together
    pub batch_size: usize,
    /// Longest a partial batch waits before being flushed
    pub max_wait: Duration,
    /// Waiting submissions beyond which new ones are rejected
    pub max_pending: usize,
}

impl Default for BatchedConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_wait: Duration::from_millis(50),
            max_pending: 1000,
        }
    }
}

impl BatchedConfig {
    /// Set the batch size
    #[must_use]
    pub const fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the flush deadline for partial batches
    #[must_use]
    pub const fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait;
        self
    }

    /// Set the waiting-submission cap
    #[must_use]
    pub const fn with_max_pending(mut self, pending: usize) -> Self {
        self.max_pending = pending;
        self
    }
}

#[derive(Debug, Default)]
struct BatchState {
    waiting: Vec<oneshot::Sender<()>>,
    tickets: u64,
}

impl BatchState {
    fn flush(&mut self) -> usize {
        let released = self.waiting.len();
        for waiter in self.waiting.drain(..) {
            // A dropped receiver only means that submission went away.
            let _ = waiter.send(());
        }
        released
    }
}

/// Holds submissions until a batch forms, then releases them together.
#[derive(Debug)]
pub struct BatchedBackpressure {
    config: BatchedConfig,
    state: Mutex<BatchState>,
}

impl BatchedBackpressure {
    /// Create a batching controller.
    #[must_use]
    pub fn new(config: BatchedConfig) -> Self {
        Self {
            config: BatchedConfig {
                batch_size: config.batch_size.max(1),
                ..config
            },
            state: Mutex::new(BatchState::default()),
        }
    }

    /// Submissions currently waiting for their batch.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).waiting.len()
    }
}

impl Backpressure for BatchedBackpressure {
    fn admit<'a>(
        &'a self,
        definition: &'a str,
    ) -> BoxFuture<'a, Result<AdmissionPermit, BackpressureRejected>> {
        Box::pin(async move {
            let (ticket, receiver) = {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.waiting.len() >= self.config.max_pending {
                    return Err(BackpressureRejected {
                        definition: definition.to_string(),
                        strategy: self.name(),
                        reason: format!("{} submissions already waiting", state.waiting.len()),
                    });
                }

                let (sender, receiver) = oneshot::channel();
                state.waiting.push(sender);
                state.tickets += 1;
                let ticket = state.tickets;

                if state.waiting.len() >= self.config.batch_size {
                    let released = state.flush();
                    tracing::debug!(released, "Batch complete");
                    metrics::counter!("backpressure.batched.batches").increment(1);
                }
                (ticket, receiver)
            };

            if tokio::time::timeout(self.config.max_wait, receiver).await.is_err() {
                let released = self.state.lock().unwrap_or_else(PoisonError::into_inner).flush();
                if released > 0 {
                    tracing::debug!(released, "Flushed partial batch");
                    metrics::counter!("backpressure.batched.partial_flushes").increment(1);
                }
            }

            Ok(AdmissionPermit::new(definition, ticket))
        })
    }

    fn release(&self, _permit: AdmissionPermit, _outcome: AdmissionOutcome) {}

    fn name(&self) -> &'static str {
        "batched"
    }
}

/// Refuses submissions while the recent failure rate is too high.
#[derive(Debug, Clone)]
pub struct CircuitBreakerBackpressure {
    breaker: CircuitBreaker,
    tickets: Arc<AtomicU64>,
}

impl CircuitBreakerBackpressure {
    /// Create a breaker-backed controller.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(config),
            tickets: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The underlying breaker.
    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

impl Backpressure for CircuitBreakerBackpressure {
    fn admit<'a>(
        &'a self,
        definition: &'a str,
    ) -> BoxFuture<'a, Result<AdmissionPermit, BackpressureRejected>> {
        let decision = match self.breaker.try_acquire() {
            Ok(admission) => {
                let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
                let permit = AdmissionPermit::new(definition, ticket);
                Ok(if admission.is_probe() { permit.as_probe() } else { permit })
            }
            Err(open) => Err(BackpressureRejected {
                definition: definition.to_string(),
                strategy: self.name(),
                reason: open.to_string(),
            }),
        };
        metrics::gauge!("backpressure.circuit_breaker.state").set(self.breaker.state().as_gauge());
        Box::pin(async move { decision })
    }

    fn release(&self, permit: AdmissionPermit, outcome: AdmissionOutcome) {
        self.breaker.record(Admission::new(permit.is_probe()), outcome.success);
        metrics::gauge!("backpressure.circuit_breaker.state").set(self.breaker.state().as_gauge());
    }

    fn name(&self) -> &'static str {
        "circuit_breaker"
    }
}
