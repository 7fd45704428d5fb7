//! Wiring shared by the Saga and TCC engines: ports, shutdown tracking and
//! write-through persistence.

use crate::backpressure::UnboundedBackpressure;
use crate::compensation_error::CompensationErrorHandler;
use crate::error::EngineError;
use crate::events::TracingEventSink;
use crate::persistence::InMemoryExecutionStore;
use chrono::{DateTime, Utc};
use sagaflow_core::backpressure::Backpressure;
use sagaflow_core::environment::{Clock, SystemClock};
use sagaflow_core::events::EventSink;
use sagaflow_core::execution::{ExecutionRecord, SagaExecution, TccExecution};
use sagaflow_core::persistence::{ExecutionStore, PersistenceError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// The pluggable ports an engine talks to.
///
/// # Defaults
///
/// - events: [`TracingEventSink`]
/// - backpressure: [`UnboundedBackpressure`]
/// - compensation-error handler: [`CompensationErrorHandler::LogAndContinue`]
/// - clock: [`SystemClock`]
#[derive(Clone)]
pub struct EnginePorts {
    store: Arc<dyn ExecutionStore>,
    events: Arc<dyn EventSink>,
    backpressure: Arc<dyn Backpressure>,
    error_handler: CompensationErrorHandler,
    clock: Arc<dyn Clock>,
}

impl EnginePorts {
    /// Ports around a store, with defaults for everything else.
    #[must_use]
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            events: Arc::new(TracingEventSink),
            backpressure: Arc::new(UnboundedBackpressure::default()),
            error_handler: CompensationErrorHandler::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Ports around a fresh [`InMemoryExecutionStore`].
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryExecutionStore::new()))
    }

    /// Set the events port
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Set the backpressure controller
    #[must_use]
    pub fn with_backpressure(mut self, backpressure: Arc<dyn Backpressure>) -> Self {
        self.backpressure = backpressure;
        self
    }

    /// Set the compensation-error handler
    #[must_use]
    pub fn with_error_handler(mut self, handler: CompensationErrorHandler) -> Self {
        self.error_handler = handler;
        self
    }

    /// Set the clock
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The persistence port.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// The events port.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// The backpressure controller.
    #[must_use]
    pub fn backpressure(&self) -> &Arc<dyn Backpressure> {
        &self.backpressure
    }

    /// The compensation-error handler.
    #[must_use]
    pub const fn error_handler(&self) -> &CompensationErrorHandler {
        &self.error_handler
    }

    /// The clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl std::fmt::Debug for EnginePorts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginePorts")
            .field("backpressure", &self.backpressure.name())
            .field("error_handler", &self.error_handler)
            .finish_non_exhaustive()
    }
}

/// Shutdown flag and in-flight counter, shared by every engine of an orchestrator.
///
/// Cloning shares the state.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    shutting_down: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
}

impl ShutdownSignal {
    /// A signal that is not shutting down.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether shutdown was initiated.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Executions currently being driven.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Stop accepting work.
    pub fn initiate(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    /// Register an execution as in flight.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShuttingDown`] once shutdown was initiated.
    pub fn enter(&self) -> Result<InFlightGuard, EngineError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard(Arc::clone(&self.in_flight));
        if self.is_shutting_down() {
            metrics::counter!("engine.shutdown.rejected").increment(1);
            return Err(EngineError::ShuttingDown);
        }
        Ok(guard)
    }

    /// Initiate shutdown and wait for in-flight executions to finish.
    ///
    /// Handlers are never aborted; executions stop at their next layer or phase
    /// boundary.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShutdownTimeout`] if executions are still running
    /// when `timeout` elapses.
    pub async fn drain(&self, timeout: Duration) -> Result<(), EngineError> {
        tracing::info!("Initiating graceful shutdown");
        metrics::counter!("engine.shutdown.initiated").increment(1);
        self.initiate();

        let start = tokio::time::Instant::now();
        let poll_interval = Duration::from_millis(10);

        loop {
            let pending = self.in_flight();

            if pending == 0 {
                tracing::info!("All executions drained, shutdown successful");
                metrics::counter!("engine.shutdown.completed").increment(1);
                return Ok(());
            }

            if start.elapsed() >= timeout {
                tracing::error!(in_flight = pending, "Shutdown timeout: {} executions still running", pending);
                metrics::counter!("engine.shutdown.timeout").increment(1);
                return Err(EngineError::ShutdownTimeout(pending));
            }

            tracing::debug!(
                in_flight = pending,
                elapsed_ms = start.elapsed().as_millis(),
                "Waiting for executions to drain"
            );
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Decrements the in-flight counter on drop.
#[derive(Debug)]
pub struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Execution records written through the persistence port.
pub(crate) trait Persisted: Clone + Into<ExecutionRecord> {
    fn revision_mut(&mut self) -> &mut u64;
    fn touch(&mut self, now: DateTime<Utc>);
}

impl Persisted for SagaExecution {
    fn revision_mut(&mut self) -> &mut u64 {
        &mut self.revision
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

impl Persisted for TccExecution {
    fn revision_mut(&mut self) -> &mut u64 {
        &mut self.revision
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

/// Bump the revision and save. The revision is rolled back if the save fails.
pub(crate) async fn write_through<T: Persisted>(
    ports: &EnginePorts,
    execution: &mut T,
) -> Result<(), PersistenceError> {
    *execution.revision_mut() += 1;
    execution.touch(ports.clock.now());

    let started = std::time::Instant::now();
    let result = ports.store.save(execution.clone().into()).await;
    metrics::histogram!("persistence.save.duration_seconds").record(started.elapsed().as_secs_f64());

    if let Err(error) = &result {
        *execution.revision_mut() -= 1;
        tracing::error!(error = %error, "Failed to persist execution transition");
        metrics::counter!("persistence.save.failures").increment(1);
    }
    result
}

/// Delete a terminal execution once its terminal event was acknowledged.
pub(crate) async fn retire(ports: &EnginePorts, record: &ExecutionRecord) {
    if let Err(error) = ports.store.delete(record.id()).await {
        tracing::warn!(
            execution_id = %record.id(),
            error = %error,
            "Failed to retire terminal execution"
        );
    } else {
        tracing::debug!(execution_id = %record.id(), "Retired terminal execution");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enter_rejected_after_initiate() {
        let signal = ShutdownSignal::new();
        let guard = signal.enter().unwrap();
        assert_eq!(signal.in_flight(), 1);

        signal.initiate();
        assert_eq!(signal.enter().unwrap_err(), EngineError::ShuttingDown);
        assert_eq!(signal.in_flight(), 1);

        drop(guard);
        assert_eq!(signal.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out_with_pending() {
        let signal = ShutdownSignal::new();
        let _guard = signal.enter().unwrap();

        let err = signal.drain(Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err, EngineError::ShutdownTimeout(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_guard() {
        let signal = ShutdownSignal::new();
        let guard = signal.enter().unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });

        assert!(signal.drain(Duration::from_secs(1)).await.is_ok());
    }
}
