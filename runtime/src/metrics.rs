//! Prometheus metrics for the engines.
//!
//! Every component records through the `metrics` facade; this module describes
//! the metric families and installs the Prometheus exporter:
//! - Saga executions, steps and compensations
//! - TCC executions and participant phases
//! - Backpressure strategies
//! - Persistence writes, event delivery and shutdown
//!
//! Metric names are dotted (`saga.executions.started`); the Prometheus exporter
//! renders them with underscores (`saga_executions_started`).
//!
//! # Example
//!
//! ```rust,no_run
//! use sagaflow_runtime::metrics::MetricsRecorder;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut recorder = MetricsRecorder::new();
//! recorder.install()?;
//!
//! // Serve this from the host application's scrape endpoint.
//! if let Some(text) = recorder.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder for the engine metrics.
///
/// Installs the global recorder and renders the scrape payload. Serving that
/// payload over HTTP is left to the host application.
#[derive(Default)]
pub struct MetricsRecorder {
    handle: Option<PrometheusHandle>,
}

impl MetricsRecorder {
    /// Create a recorder that is not installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe every metric and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// A recorder that is already installed (e.g., by another test) is not an
    /// error; [`MetricsRecorder::render`] then returns `None`.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this recorder did not install the global recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Saga
    describe_counter!("saga.executions.started", "Saga executions admitted");
    describe_counter!("saga.executions.resumed", "Saga executions re-driven by recovery");
    describe_counter!("saga.executions.completed", "Saga executions where every step succeeded");
    describe_counter!("saga.executions.compensated", "Saga executions fully compensated");
    describe_counter!("saga.executions.failed", "Saga executions left uncompensated or in unknown state");
    describe_counter!("saga.executions.rejected", "Saga submissions refused by backpressure");
    describe_histogram!("saga.executions.duration_seconds", "Wall time of a Saga execution");
    describe_counter!("saga.steps.succeeded", "Steps that succeeded");
    describe_counter!("saga.steps.failed", "Steps that failed after their retries");
    describe_counter!("saga.layers.hang_warnings", "Layers still waiting on steps after the grace interval");
    describe_counter!("saga.compensations.started", "Compensation runs started");
    describe_counter!("saga.compensations.succeeded", "Steps compensated");
    describe_counter!("saga.compensations.failed", "Compensations that failed for good");
    describe_counter!("saga.compensations.skipped", "Compensations skipped by an open circuit");

    // TCC
    describe_counter!("tcc.executions.started", "TCC executions admitted");
    describe_counter!("tcc.executions.resumed", "TCC executions re-driven by recovery");
    describe_counter!("tcc.executions.confirmed", "TCC executions confirmed");
    describe_counter!("tcc.executions.cancelled", "TCC executions fully cancelled");
    describe_counter!("tcc.executions.failed", "TCC executions with outstanding reservations or unknown state");
    describe_counter!("tcc.executions.rejected", "TCC submissions refused by backpressure");
    describe_histogram!("tcc.executions.duration_seconds", "Wall time of a TCC execution");
    describe_counter!("tcc.participants.try_failed", "Try calls that failed after their retries");
    describe_counter!("tcc.confirm.failures", "Confirm calls that failed after their retries");
    describe_counter!("tcc.cancel.failures", "Cancel calls that failed for good");

    // Backpressure
    describe_counter!("backpressure.rejections", "Submissions refused, labelled by strategy");
    describe_gauge!("backpressure.adaptive.limit", "Current adaptive concurrency limit");
    describe_counter!("backpressure.batched.batches", "Batches released");
    describe_counter!("backpressure.batched.partial_flushes", "Partial batches flushed after max wait");
    describe_gauge!(
        "backpressure.circuit_breaker.state",
        "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
    );

    // Retry
    describe_counter!("retry.attempts", "Retry attempts scheduled");
    describe_counter!("retry.exhausted", "Operations that exhausted their retries");

    // Persistence, events, shutdown
    describe_histogram!("persistence.save.duration_seconds", "Time taken to save an execution record");
    describe_counter!("persistence.save.failures", "Execution record saves that failed");
    describe_counter!("events.emit.failures", "Lifecycle events the sink failed to accept");
    describe_counter!("engine.shutdown.initiated", "Graceful shutdowns initiated");
    describe_counter!("engine.shutdown.completed", "Graceful shutdowns that drained in time");
    describe_counter!("engine.shutdown.timeout", "Graceful shutdowns that timed out");
    describe_counter!("engine.shutdown.rejected", "Submissions refused during shutdown");
    describe_counter!("recovery.scans", "Recovery scans run");
    describe_counter!("recovery.resumed", "Stale executions resumed by recovery");
    describe_counter!("recovery.failures", "Stale executions recovery could not resume");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_recorder_is_not_installed() {
        let recorder = MetricsRecorder::new();
        assert!(recorder.handle().is_none());
        assert!(recorder.render().is_none());
    }

    #[tokio::test]
    async fn test_installed_recorder_renders() {
        let mut recorder = MetricsRecorder::new();
        recorder.install().unwrap();

        metrics::counter!("saga.executions.started").increment(1);
        metrics::gauge!("backpressure.adaptive.limit").set(20.0);

        // Another test may have installed the recorder first.
        if let Some(rendered) = recorder.render() {
            assert!(rendered.contains("saga_executions_started"));
            assert!(rendered.contains("backpressure_adaptive_limit"));
        }
    }
}
