//! Saga execution engine.
//!
//! Runs a [`SagaDefinition`] layer by layer. Steps of one layer run concurrently,
//! bounded by the definition's layer concurrency; the next layer starts only once
//! every step of the current one is terminal. The first step failure stops the
//! forward run and hands the execution to the compensation engine.
//!
//! Every step transition is written through the persistence port before the
//! engine proceeds, so a crashed process can be resumed with
//! [`SagaEngine::resume`].

use crate::config::EngineConfig;
use crate::engine::{EnginePorts, ShutdownSignal, retire, write_through};
use crate::error::EngineError;
use crate::events::emit_best_effort;
use crate::retry::retry_while;
use futures::future::join_all;
use sagaflow_core::backpressure::AdmissionOutcome;
use sagaflow_core::context::{StepContext, StepOutput};
use sagaflow_core::definition::{ExecutionMode, SagaDefinition, StepDefinition};
use sagaflow_core::error::{HandlerError, StepError};
use sagaflow_core::events::LifecycleEvent;
use sagaflow_core::execution::{ExecutionRecord, SagaExecution, SagaStatus, StepStatus};
use sagaflow_core::id::ExecutionId;
use sagaflow_core::persistence::PersistenceError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};

/// Drives Saga executions.
///
/// # Example
///
/// ```
/// use sagaflow_core::context::StepOutput;
/// use sagaflow_core::definition::{SagaDefinition, StepDefinition};
/// use sagaflow_core::execution::SagaStatus;
/// use sagaflow_core::handler::step_fn;
/// use sagaflow_runtime::config::EngineConfig;
/// use sagaflow_runtime::engine::EnginePorts;
/// use sagaflow_runtime::saga::SagaEngine;
/// use serde_json::json;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let saga = SagaDefinition::builder("greet")
///     .step(StepDefinition::new("hello", step_fn(|_| async {
///         Ok(StepOutput::with_output(json!("hi")))
///     })))
///     .build()?;
///
/// let engine = SagaEngine::new(EnginePorts::in_memory(), EngineConfig::default());
/// let execution = engine.execute(&saga, json!({})).await?;
/// assert_eq!(execution.status, SagaStatus::Completed);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SagaEngine {
    ports: EnginePorts,
    config: EngineConfig,
    shutdown: ShutdownSignal,
}

impl SagaEngine {
    /// Create an engine with its own shutdown signal.
    #[must_use]
    pub fn new(ports: EnginePorts, config: EngineConfig) -> Self {
        Self {
            ports,
            config,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Share a shutdown signal with other engines.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// The engine's ports.
    #[must_use]
    pub const fn ports(&self) -> &EnginePorts {
        &self.ports
    }

    /// The engine's configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The shutdown signal this engine observes.
    #[must_use]
    pub const fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Execute a Saga with no headers.
    ///
    /// # Errors
    ///
    /// See [`SagaEngine::execute_with_headers`].
    pub async fn execute(
        &self,
        definition: &SagaDefinition,
        input: Value,
    ) -> Result<SagaExecution, EngineError> {
        self.execute_with_headers(definition, input, HashMap::new())
            .await
    }

    /// Execute a Saga to a terminal status.
    ///
    /// Transaction outcomes, persistence failures included, are reported through
    /// the returned execution's status and manifest.
    ///
    /// # Errors
    ///
    /// - [`EngineError::ShuttingDown`] if shutdown was initiated
    /// - [`EngineError::Rejected`] if backpressure refused the submission
    #[tracing::instrument(skip_all, name = "saga_execute", fields(definition = %definition.name()))]
    pub async fn execute_with_headers(
        &self,
        definition: &SagaDefinition,
        input: Value,
        headers: HashMap<String, String>,
    ) -> Result<SagaExecution, EngineError> {
        let _in_flight = self.shutdown.enter()?;

        let permit = self
            .ports
            .backpressure()
            .admit(definition.name())
            .await
            .map_err(|rejected| {
                tracing::warn!(reason = %rejected.reason, strategy = rejected.strategy, "Saga submission rejected");
                metrics::counter!("saga.executions.rejected").increment(1);
                metrics::counter!("backpressure.rejections", "strategy" => rejected.strategy).increment(1);
                EngineError::Rejected(rejected)
            })?;

        let started = Instant::now();
        let execution = SagaExecution::new(definition, input, headers, self.ports.clock().now());
        tracing::info!(execution_id = %execution.id, "Saga execution starting");
        metrics::counter!("saga.executions.started").increment(1);

        let execution = self.drive(definition, execution).await;

        let latency = started.elapsed();
        let outcome = if execution.status == SagaStatus::Completed {
            AdmissionOutcome::success(latency)
        } else {
            AdmissionOutcome::failure(latency)
        };
        self.ports.backpressure().release(permit, outcome);
        metrics::histogram!("saga.executions.duration_seconds").record(latency.as_secs_f64());

        Ok(execution)
    }

    /// Re-drive a persisted execution.
    ///
    /// - `Pending` or `Running`: continue from the first layer with unfinished steps
    /// - `Running` with a failed step, or `Compensating`: run compensation
    /// - terminal: returned unchanged, no handler is invoked
    ///
    /// Resumption does not go through backpressure.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShuttingDown`] if shutdown was initiated.
    #[tracing::instrument(skip_all, name = "saga_resume", fields(execution_id = %execution.id))]
    pub async fn resume(
        &self,
        definition: &SagaDefinition,
        execution: SagaExecution,
    ) -> Result<SagaExecution, EngineError> {
        if execution.is_terminal() {
            tracing::debug!(status = %execution.status, "Execution already terminal; nothing to resume");
            return Ok(execution);
        }

        let _in_flight = self.shutdown.enter()?;
        tracing::info!(status = %execution.status, "Resuming saga execution");
        metrics::counter!("saga.executions.resumed").increment(1);
        Ok(self.drive(definition, execution).await)
    }

    async fn drive(&self, definition: &SagaDefinition, execution: SagaExecution) -> SagaExecution {
        let run = SagaRun::new(definition, execution);
        let (status, has_failed_step) = run
            .read(|e| (e.status, e.steps.iter().any(|s| s.status == StepStatus::Failed)))
            .await;

        let ending = match status {
            SagaStatus::Pending => {
                let now = self.ports.clock().now();
                run.update(&self.ports, |e| {
                    e.status = SagaStatus::Running;
                    e.started_at = Some(now);
                })
                .await;
                emit_best_effort(
                    self.ports.events().as_ref(),
                    LifecycleEvent::SagaStarted {
                        execution_id: run.id,
                        definition: definition.name().to_string(),
                    },
                )
                .await;
                self.forward(&run).await
            }
            SagaStatus::Running if has_failed_step => self.compensate(&run).await,
            SagaStatus::Running => self.forward(&run).await,
            SagaStatus::Compensating => self.compensate(&run).await,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed => Ending::Interrupted,
        };

        self.conclude(run, ending).await
    }

    async fn forward(&self, run: &SagaRun<'_>) -> Ending {
        for (index, layer) in run.definition.plan().layers().iter().enumerate() {
            if run.persistence_lost() {
                return Ending::Interrupted;
            }

            let pending: Vec<&str> = run
                .read(|e| {
                    layer
                        .iter()
                        .filter(|id| e.step(id).is_none_or(|s| s.status != StepStatus::Succeeded))
                        .map(String::as_str)
                        .collect()
                })
                .await;
            if pending.is_empty() {
                continue;
            }

            if self.shutdown.is_shutting_down() {
                tracing::info!(
                    execution_id = %run.id,
                    layer = index,
                    "Shutdown requested; leaving execution for recovery"
                );
                return Ending::Interrupted;
            }

            tracing::debug!(execution_id = %run.id, layer = index, steps = pending.len(), "Starting layer");
            let semaphore = Semaphore::new(run.definition.layer_concurrency());
            let steps = join_all(pending.iter().map(|id| self.run_step(run, &semaphore, id)));
            self.await_layer(run, index, steps).await;

            if run.persistence_lost() {
                return Ending::Interrupted;
            }
            if run.is_halted() {
                return self.compensate(run).await;
            }
        }

        Ending::Completed
    }

    /// Wait for a layer, warning every grace interval while steps remain in flight.
    async fn await_layer<F: std::future::Future>(&self, run: &SagaRun<'_>, layer: usize, steps: F) {
        let started = Instant::now();
        let mut steps = std::pin::pin!(steps);

        while tokio::time::timeout(self.config.in_flight_grace, steps.as_mut())
            .await
            .is_err()
        {
            tracing::warn!(
                execution_id = %run.id,
                layer,
                halted = run.is_halted(),
                elapsed_secs = started.elapsed().as_secs(),
                "Layer still has steps in flight"
            );
            metrics::counter!("saga.layers.hang_warnings").increment(1);
        }
    }

    async fn run_step(&self, run: &SagaRun<'_>, semaphore: &Semaphore, step_id: &str) {
        let Some(step) = run.definition.step(step_id) else {
            return;
        };
        let Ok(_permit) = semaphore.acquire().await else {
            return;
        };
        if run.is_halted() {
            return;
        }

        let now = self.ports.clock().now();
        let (variables, dependency_outputs) = run
            .update(&self.ports, |e| {
                let dependency_outputs: HashMap<String, Value> = step
                    .dependencies()
                    .iter()
                    .filter_map(|dep| {
                        let output = e.step(dep)?.output.clone()?;
                        Some((dep.clone(), output))
                    })
                    .collect();
                if let Some(record) = e.step_mut(step_id) {
                    record.status = StepStatus::Running;
                    record.started_at = Some(now);
                }
                (e.variables.clone(), dependency_outputs)
            })
            .await;
        if run.persistence_lost() {
            return;
        }

        let timeout = step.timeout_or(self.config.default_step_timeout);
        let result = retry_while(
            step.retry_policy(),
            |attempt| {
                let ctx = StepContext::new(
                    run.id,
                    step_id.to_string(),
                    attempt,
                    Arc::clone(&run.input),
                    Arc::clone(&run.headers),
                    variables.clone(),
                    dependency_outputs.clone(),
                );
                invoke(step, ctx, timeout)
            },
            |err: &AttemptError| err.is_retryable() && !run.is_halted(),
            || !run.is_halted(),
        )
        .await;

        match result {
            Ok((output, attempts)) => self.step_succeeded(run, step_id, output, attempts).await,
            Err(exhausted) => {
                let error = match exhausted.error {
                    AttemptError::TimedOut(timeout) => StepError::Timeout {
                        step: step_id.to_string(),
                        attempts: exhausted.attempts,
                        timeout,
                    },
                    other => StepError::Execution {
                        step: step_id.to_string(),
                        attempts: exhausted.attempts,
                        message: other.to_string(),
                    },
                };
                self.step_failed(run, error).await;
            }
        }
    }

    async fn step_succeeded(&self, run: &SagaRun<'_>, step_id: &str, output: StepOutput, attempts: u32) {
        let (output, variables) = output.into_parts();
        let now = self.ports.clock().now();
        run.update(&self.ports, |e| {
            e.variables.extend(variables);
            if let Some(record) = e.step_mut(step_id) {
                record.status = StepStatus::Succeeded;
                record.attempts = attempts;
                record.output = output;
                record.last_error = None;
                record.ended_at = Some(now);
            }
        })
        .await;

        tracing::debug!(execution_id = %run.id, step_id, attempts, "Step succeeded");
        metrics::counter!("saga.steps.succeeded").increment(1);
        emit_best_effort(
            self.ports.events().as_ref(),
            LifecycleEvent::StepCompleted {
                execution_id: run.id,
                step_id: step_id.to_string(),
                attempts,
            },
        )
        .await;
    }

    async fn step_failed(&self, run: &SagaRun<'_>, error: StepError) {
        run.halt();
        let message = error.to_string();
        let now = self.ports.clock().now();
        run.update(&self.ports, |e| {
            if let Some(record) = e.step_mut(error.step()) {
                record.status = StepStatus::Failed;
                record.attempts = error.attempts();
                record.last_error = Some(message.clone());
                record.ended_at = Some(now);
            }
            e.error.get_or_insert_with(|| message.clone());
        })
        .await;

        tracing::warn!(execution_id = %run.id, step_id = error.step(), error = %message, "Step failed");
        metrics::counter!("saga.steps.failed").increment(1);
        emit_best_effort(
            self.ports.events().as_ref(),
            LifecycleEvent::StepFailed {
                execution_id: run.id,
                step_id: error.step().to_string(),
                error: message,
            },
        )
        .await;
    }

    async fn conclude(&self, run: SagaRun<'_>, ending: Ending) -> SagaExecution {
        let definition = run.definition.name().to_string();
        let (mut execution, lost) = run.into_parts();
        let now = self.ports.clock().now();

        let failure = if let Some(error) = lost {
            Some(error)
        } else {
            let (status, message) = match ending {
                Ending::Interrupted => return execution,
                Ending::Completed => (SagaStatus::Completed, None),
                Ending::Compensated => (SagaStatus::Compensated, None),
                Ending::Incomplete(message) => (SagaStatus::Failed, Some(message)),
            };
            execution.status = status;
            execution.ended_at = Some(now);
            if let Some(message) = message {
                execution.error.get_or_insert(message);
            }
            write_through(&self.ports, &mut execution).await.err()
        };

        if let Some(error) = failure {
            execution.status = SagaStatus::Failed;
            execution.state_unknown = true;
            execution.error = Some(error.to_string());
            execution.ended_at = Some(now);
        }

        let event = match execution.status {
            SagaStatus::Completed => {
                metrics::counter!("saga.executions.completed").increment(1);
                LifecycleEvent::SagaCompleted {
                    execution_id: execution.id,
                    definition,
                }
            }
            SagaStatus::Compensated => {
                metrics::counter!("saga.executions.compensated").increment(1);
                LifecycleEvent::SagaCompensated {
                    execution_id: execution.id,
                    definition,
                }
            }
            _ => {
                metrics::counter!("saga.executions.failed").increment(1);
                LifecycleEvent::SagaFailed {
                    execution_id: execution.id,
                    definition,
                    error: execution.error.clone().unwrap_or_default(),
                }
            }
        };
        tracing::info!(
            execution_id = %execution.id,
            status = %execution.status,
            state_unknown = execution.state_unknown,
            "Saga execution finished"
        );

        let acknowledged = emit_best_effort(self.ports.events().as_ref(), event).await;
        if acknowledged && self.config.retire_terminal_executions && !execution.state_unknown {
            retire(&self.ports, &ExecutionRecord::Saga(execution.clone())).await;
        }

        execution
    }
}

/// How a drive ended.
pub(crate) enum Ending {
    /// Every step succeeded
    Completed,
    /// Every eligible step was compensated
    Compensated,
    /// Compensation left work behind
    Incomplete(String),
    /// Stopped for shutdown or lost persistence; nothing more to write
    Interrupted,
}

/// One in-flight execution of a definition.
pub(crate) struct SagaRun<'d> {
    pub(crate) definition: &'d SagaDefinition,
    pub(crate) id: ExecutionId,
    pub(crate) input: Arc<Value>,
    headers: Arc<HashMap<String, String>>,
    execution: Mutex<SagaExecution>,
    halted: AtomicBool,
    lost: std::sync::Mutex<Option<PersistenceError>>,
}

impl<'d> SagaRun<'d> {
    fn new(definition: &'d SagaDefinition, execution: SagaExecution) -> Self {
        Self {
            definition,
            id: execution.id,
            input: Arc::new(execution.input.clone()),
            headers: Arc::new(execution.headers.clone()),
            execution: Mutex::new(execution),
            halted: AtomicBool::new(false),
            lost: std::sync::Mutex::new(None),
        }
    }

    /// Whether the forward run must not start or retry further steps.
    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    fn halt(&self) {
        self.halted.store(true, Ordering::Release);
    }

    /// Whether a persistence write failed during this run.
    pub(crate) fn persistence_lost(&self) -> bool {
        self.lost
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub(crate) async fn read<R>(&self, f: impl FnOnce(&SagaExecution) -> R) -> R {
        f(&*self.execution.lock().await)
    }

    /// Mutate the execution and write it through.
    ///
    /// After the first failed write the run stops persisting; later mutations stay
    /// in memory only.
    pub(crate) async fn update<R>(&self, ports: &EnginePorts, f: impl FnOnce(&mut SagaExecution) -> R) -> R {
        let mut execution = self.execution.lock().await;
        let result = f(&mut execution);
        if self.persistence_lost() {
            return result;
        }

        if let Err(error) = write_through(ports, &mut *execution).await {
            tracing::error!(execution_id = %self.id, error = %error, "Halting execution: state is unknown");
            *self.lost.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
            self.halt();
        }
        result
    }

    fn into_parts(self) -> (SagaExecution, Option<PersistenceError>) {
        let lost = self.lost.into_inner().unwrap_or_else(PoisonError::into_inner);
        (self.execution.into_inner(), lost)
    }
}

/// Why a single attempt failed.
#[derive(Debug)]
enum AttemptError {
    Handler(HandlerError),
    TimedOut(Duration),
    Aborted(String),
}

impl AttemptError {
    const fn is_retryable(&self) -> bool {
        match self {
            Self::Handler(error) => error.is_retryable(),
            Self::TimedOut(_) | Self::Aborted(_) => true,
        }
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handler(error) => write!(f, "{error}"),
            Self::TimedOut(timeout) => write!(f, "timed out after {timeout:?}"),
            Self::Aborted(reason) => write!(f, "offloaded task aborted: {reason}"),
        }
    }
}

/// One attempt, raced against the step timeout.
async fn invoke(step: &StepDefinition, ctx: StepContext, timeout: Duration) -> Result<StepOutput, AttemptError> {
    match step.execution_mode() {
        ExecutionMode::Inline => match tokio::time::timeout(timeout, step.handler().execute(&ctx)).await {
            Ok(result) => result.map_err(AttemptError::Handler),
            Err(_) => Err(AttemptError::TimedOut(timeout)),
        },
        ExecutionMode::Offload => {
            let handler = Arc::clone(step.handler());
            let task = tokio::spawn(async move { handler.execute(&ctx).await });
            // Dropping the handle on timeout detaches the task; its result is ignored.
            match tokio::time::timeout(timeout, task).await {
                Ok(Ok(result)) => result.map_err(AttemptError::Handler),
                Ok(Err(join_error)) => Err(AttemptError::Aborted(join_error.to_string())),
                Err(_) => Err(AttemptError::TimedOut(timeout)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sagaflow_core::RetryPolicy;
    use sagaflow_core::handler::{compensation_fn, step_fn};
    use serde_json::json;

    fn engine() -> SagaEngine {
        SagaEngine::new(EnginePorts::in_memory(), EngineConfig::default())
    }

    #[tokio::test]
    async fn test_outputs_flow_to_direct_dependents() {
        let saga = SagaDefinition::builder("pipeline")
            .step(StepDefinition::new(
                "a",
                step_fn(|_| async { Ok(StepOutput::with_output(json!(2)).variable("seen", json!(true))) }),
            ))
            .step(
                StepDefinition::new(
                    "b",
                    step_fn(|ctx| async move {
                        let a: i64 = ctx.output_as("a")?;
                        assert_eq!(ctx.variable("seen"), Some(&json!(true)));
                        Ok(StepOutput::with_output(json!(a * 10)))
                    }),
                )
                .depends_on("a"),
            )
            .build()
            .unwrap();

        let execution = engine().execute(&saga, json!({})).await.unwrap();

        assert_eq!(execution.status, SagaStatus::Completed);
        assert_eq!(execution.step("b").unwrap().output, Some(json!(20)));
        assert_eq!(execution.revision, 6);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let saga = SagaDefinition::builder("permanent")
            .step(
                StepDefinition::new(
                    "a",
                    step_fn(|_| async { Err(HandlerError::permanent("card declined")) }),
                )
                .retry(RetryPolicy::new().with_max_attempts(5)),
            )
            .build()
            .unwrap();

        let execution = engine().execute(&saga, json!({})).await.unwrap();

        let step = execution.step("a").unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.attempts, 1);
        assert_eq!(execution.status, SagaStatus::Compensated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_surfaces_as_step_timeout() {
        let saga = SagaDefinition::builder("slow")
            .step(
                StepDefinition::new(
                    "a",
                    step_fn(|_| async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(StepOutput::empty())
                    }),
                )
                .timeout(Duration::from_millis(100))
                .retry(RetryPolicy::no_retry()),
            )
            .build()
            .unwrap();

        let execution = engine().execute(&saga, json!({})).await.unwrap();

        let error = execution.step("a").unwrap().last_error.clone().unwrap();
        assert!(error.contains("timed out"), "{error}");
    }

    #[tokio::test]
    async fn test_offloaded_step_runs_on_spawned_task() {
        let saga = SagaDefinition::builder("offload")
            .step(
                StepDefinition::new("crunch", step_fn(|_| async { Ok(StepOutput::with_output(json!(42))) }))
                    .offload()
                    .compensate_with(compensation_fn(|_| async { Ok(()) })),
            )
            .build()
            .unwrap();

        let execution = engine().execute(&saga, json!({})).await.unwrap();
        assert_eq!(execution.step("crunch").unwrap().output, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_resume_of_terminal_execution_is_noop() {
        let saga = SagaDefinition::builder("noop")
            .step(StepDefinition::new("a", step_fn(|_| async { Ok(StepOutput::empty()) })))
            .build()
            .unwrap();
        let engine = engine();
        let done = engine.execute(&saga, json!({})).await.unwrap();

        let resumed = engine.resume(&saga, done.clone()).await.unwrap();
        assert_eq!(resumed, done);
    }
}
