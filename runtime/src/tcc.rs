//! Try-Confirm-Cancel execution engine.
//!
//! Participants are tried one at a time in declared order. If every required
//! participant reserved its resources the reservations are confirmed, otherwise
//! the ones that were reserved are cancelled in reverse order.
//!
//! Confirm failures never trigger a cancel: once the decision to commit is
//! persisted it is final, and failed confirms are re-driven with
//! [`TccEngine::retry_confirm`].

use crate::config::EngineConfig;
use crate::compensation_error::{CompensationVerdict, undo};
use crate::engine::{EnginePorts, ShutdownSignal, retire, write_through};
use crate::error::EngineError;
use crate::events::emit_best_effort;
use crate::retry::{Exhausted, retry_with_predicate};
use sagaflow_core::backpressure::AdmissionOutcome;
use sagaflow_core::context::ParticipantContext;
use sagaflow_core::definition::{ParticipantDefinition, TccDefinition};
use sagaflow_core::error::{HandlerError, TccParticipantError, TccPhase};
use sagaflow_core::events::LifecycleEvent;
use sagaflow_core::execution::{ExecutionRecord, PhaseStatus, TccExecution, TccStatus};
use sagaflow_core::persistence::PersistenceError;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Drives TCC executions.
#[derive(Debug, Clone)]
pub struct TccEngine {
    ports: EnginePorts,
    config: EngineConfig,
    shutdown: ShutdownSignal,
}

impl TccEngine {
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

    /// The shutdown signal this engine observes.
    #[must_use]
    pub const fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Execute a TCC transaction to a terminal status.
    ///
    /// # Errors
    ///
    /// - [`EngineError::ShuttingDown`] if shutdown was initiated
    /// - [`EngineError::Rejected`] if backpressure refused the submission
    #[tracing::instrument(skip_all, name = "tcc_execute", fields(definition = %definition.name()))]
    pub async fn execute(
        &self,
        definition: &TccDefinition,
        input: Value,
    ) -> Result<TccExecution, EngineError> {
        let _in_flight = self.shutdown.enter()?;

        let permit = self
            .ports
            .backpressure()
            .admit(definition.name())
            .await
            .map_err(|rejected| {
                tracing::warn!(reason = %rejected.reason, strategy = rejected.strategy, "TCC submission rejected");
                metrics::counter!("tcc.executions.rejected").increment(1);
                metrics::counter!("backpressure.rejections", "strategy" => rejected.strategy).increment(1);
                EngineError::Rejected(rejected)
            })?;

        let started = std::time::Instant::now();
        let mut run = TccRun::new(definition, TccExecution::new(definition, input, self.ports.clock().now()));
        tracing::info!(execution_id = %run.execution.id, "TCC execution starting");
        metrics::counter!("tcc.executions.started").increment(1);

        run.update(&self.ports, |_| ()).await;
        emit_best_effort(
            self.ports.events().as_ref(),
            LifecycleEvent::TccStarted {
                execution_id: run.execution.id,
                definition: definition.name().to_string(),
            },
        )
        .await;

        let ending = match self.try_phase(&mut run).await {
            TryOutcome::Reserved => self.confirm_phase(&mut run).await,
            TryOutcome::Refused => self.cancel_phase(&mut run).await,
            TryOutcome::Interrupted => Ending::Interrupted,
        };
        let execution = self.conclude(run, ending).await;

        let latency = started.elapsed();
        let outcome = if execution.status == TccStatus::Confirmed {
            AdmissionOutcome::success(latency)
        } else {
            AdmissionOutcome::failure(latency)
        };
        self.ports.backpressure().release(permit, outcome);
        metrics::histogram!("tcc.executions.duration_seconds").record(latency.as_secs_f64());

        Ok(execution)
    }

    /// Re-drive a persisted execution.
    ///
    /// - `Trying`: the interrupted Try phase counts as failed; reservations are cancelled
    /// - `Confirming`: remaining confirms are issued
    /// - `Cancelling`: remaining cancels are issued
    /// - terminal: returned unchanged, no participant is invoked
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShuttingDown`] if shutdown was initiated.
    #[tracing::instrument(skip_all, name = "tcc_resume", fields(execution_id = %execution.id))]
    pub async fn resume(
        &self,
        definition: &TccDefinition,
        execution: TccExecution,
    ) -> Result<TccExecution, EngineError> {
        if execution.is_terminal() {
            tracing::debug!(status = %execution.status, "Execution already terminal; nothing to resume");
            return Ok(execution);
        }

        let _in_flight = self.shutdown.enter()?;
        tracing::info!(status = %execution.status, "Resuming TCC execution");
        metrics::counter!("tcc.executions.resumed").increment(1);

        let mut run = TccRun::new(definition, execution);
        let ending = match run.execution.status {
            TccStatus::Trying => {
                run.update(&self.ports, |e| {
                    e.error.get_or_insert_with(|| "try phase interrupted".to_string());
                })
                .await;
                self.cancel_phase(&mut run).await
            }
            TccStatus::Confirming => self.confirm_phase(&mut run).await,
            TccStatus::Cancelling => self.cancel_phase(&mut run).await,
            TccStatus::Confirmed | TccStatus::Cancelled | TccStatus::Failed => Ending::Interrupted,
        };
        Ok(self.conclude(run, ending).await)
    }

    /// Re-issue the confirms that failed on a `Confirmed` execution.
    ///
    /// Executions in any other status are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShuttingDown`] if shutdown was initiated.
    #[tracing::instrument(skip_all, name = "tcc_retry_confirm", fields(execution_id = %execution.id))]
    pub async fn retry_confirm(
        &self,
        definition: &TccDefinition,
        execution: TccExecution,
    ) -> Result<TccExecution, EngineError> {
        if execution.status != TccStatus::Confirmed {
            tracing::debug!(status = %execution.status, "Only confirmed executions have confirms to retry");
            return Ok(execution);
        }

        let _in_flight = self.shutdown.enter()?;
        let mut run = TccRun::new(definition, execution);
        for participant in definition.participants() {
            let failed = run
                .execution
                .participant(participant.id())
                .is_some_and(|p| p.confirm_status == PhaseStatus::Failed);
            if failed {
                self.confirm_participant(&mut run, participant).await;
            }
        }

        let (mut execution, lost) = run.into_parts();
        if let Some(error) = lost {
            execution.state_unknown = true;
            execution.error = Some(error.to_string());
        }
        Ok(execution)
    }

    async fn try_phase(&self, run: &mut TccRun<'_>) -> TryOutcome {
        let definition = run.definition;
        let deadline = definition
            .global_timeout()
            .map(|total| Deadline {
                at: Instant::now() + total,
                total,
            });

        for participant in definition.participants() {
            if run.lost.is_some() {
                return TryOutcome::Interrupted;
            }
            if self.shutdown.is_shutting_down() {
                tracing::info!(execution_id = %run.execution.id, "Shutdown requested; leaving execution for recovery");
                return TryOutcome::Interrupted;
            }

            let id = participant.id();
            run.update(&self.ports, |e| {
                if let Some(p) = e.participant_mut(id) {
                    p.try_status = PhaseStatus::Running;
                }
            })
            .await;
            if run.lost.is_some() {
                return TryOutcome::Interrupted;
            }

            let per_attempt = participant.timeout_or(self.config.default_step_timeout);
            let attempts_made = AtomicU32::new(0);
            let retried = retry_with_predicate(
                participant.retry_policy(),
                |attempt| {
                    attempts_made.store(attempt, Ordering::Relaxed);
                    let ctx = run.context(id, attempt, None);
                    let participant = participant.participant();
                    call(per_attempt, deadline, async move { participant.try_reserve(&ctx).await })
                },
                CallError::is_retryable,
            );
            // Backoff sleeps count against the global deadline too.
            let result = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline.at, retried)
                    .await
                    .unwrap_or_else(|_| {
                        Err(Exhausted {
                            error: CallError::Deadline(deadline.total),
                            attempts: attempts_made.load(Ordering::Relaxed),
                        })
                    }),
                None => retried.await,
            };

            let tried = match result {
                Ok((reservation, attempts)) => {
                    run.update(&self.ports, |e| {
                        if let Some(p) = e.participant_mut(id) {
                            p.try_status = PhaseStatus::Succeeded;
                            p.attempts = attempts;
                            p.reservation = reservation;
                            p.last_error = None;
                        }
                    })
                    .await;
                    Ok(())
                }
                Err(exhausted) => {
                    let error = exhausted.error.into_participant_error(id, TccPhase::Try, exhausted.attempts);
                    let message = error.to_string();
                    run.update(&self.ports, |e| {
                        if let Some(p) = e.participant_mut(id) {
                            p.try_status = PhaseStatus::Failed;
                            p.attempts = exhausted.attempts;
                            p.last_error = Some(message.clone());
                        }
                    })
                    .await;
                    metrics::counter!("tcc.participants.try_failed").increment(1);
                    Err(error)
                }
            };

            emit_best_effort(
                self.ports.events().as_ref(),
                LifecycleEvent::TccParticipantTried {
                    execution_id: run.execution.id,
                    participant_id: id.to_string(),
                    success: tried.is_ok(),
                },
            )
            .await;

            if let Err(error) = tried {
                let global = matches!(error, TccParticipantError::GlobalTimeout { .. });
                if participant.is_optional() && !global {
                    tracing::warn!(participant = id, error = %error, "Optional participant failed to reserve; continuing");
                    continue;
                }

                tracing::warn!(participant = id, error = %error, "Try phase failed; cancelling");
                let message = error.to_string();
                run.update(&self.ports, |e| {
                    e.error.get_or_insert(message);
                })
                .await;
                return TryOutcome::Refused;
            }
        }

        if run.lost.is_some() {
            TryOutcome::Interrupted
        } else {
            TryOutcome::Reserved
        }
    }

    async fn confirm_phase(&self, run: &mut TccRun<'_>) -> Ending {
        run.update(&self.ports, |e| e.status = TccStatus::Confirming)
            .await;

        let definition = run.definition;
        for participant in definition.participants() {
            if run.lost.is_some() {
                return Ending::Interrupted;
            }
            let pending = run.execution.participant(participant.id()).is_some_and(|p| {
                p.try_status == PhaseStatus::Succeeded && p.confirm_status != PhaseStatus::Succeeded
            });
            if !pending {
                continue;
            }
            if self.shutdown.is_shutting_down() {
                tracing::info!(execution_id = %run.execution.id, "Shutdown requested during confirm; leaving for recovery");
                return Ending::Interrupted;
            }

            self.confirm_participant(run, participant).await;
        }

        if run.lost.is_some() {
            Ending::Interrupted
        } else {
            Ending::Confirmed
        }
    }

    async fn confirm_participant(&self, run: &mut TccRun<'_>, participant: &ParticipantDefinition) {
        let id = participant.id();
        let reservation = run
            .execution
            .participant(id)
            .and_then(|p| p.reservation.clone());
        let timeout = participant.timeout_or(self.config.default_step_timeout);

        let result = retry_with_predicate(
            participant.retry_policy(),
            |attempt| {
                let ctx = run.context(id, attempt, reservation.clone());
                let participant = participant.participant();
                call(timeout, None, async move { participant.confirm(&ctx).await })
            },
            CallError::is_retryable,
        )
        .await;

        let (status, attempts, error) = match result {
            Ok(((), attempts)) => (PhaseStatus::Succeeded, attempts, None),
            Err(exhausted) => {
                let error = exhausted.error.into_participant_error(id, TccPhase::Confirm, exhausted.attempts);
                tracing::error!(participant = id, error = %error, "Confirm failed; reservation left pending");
                metrics::counter!("tcc.confirm.failures").increment(1);
                (PhaseStatus::Failed, exhausted.attempts, Some(error.to_string()))
            }
        };

        run.update(&self.ports, |e| {
            if let Some(p) = e.participant_mut(id) {
                p.confirm_status = status;
                p.attempts = attempts;
                p.last_error = error;
            }
        })
        .await;
    }

    async fn cancel_phase(&self, run: &mut TccRun<'_>) -> Ending {
        run.update(&self.ports, |e| e.status = TccStatus::Cancelling)
            .await;

        let definition = run.definition;
        for participant in definition.participants().iter().rev() {
            if run.lost.is_some() {
                return Ending::Interrupted;
            }
            let id = participant.id();
            let Some(state) = run.execution.participant(id) else {
                continue;
            };
            // A Try still marked running was interrupted mid-call and may hold a reservation.
            let reserved = matches!(state.try_status, PhaseStatus::Succeeded | PhaseStatus::Running);
            if !reserved || state.cancel_status == PhaseStatus::Succeeded {
                continue;
            }
            if self.shutdown.is_shutting_down() {
                tracing::info!(execution_id = %run.execution.id, "Shutdown requested during cancel; leaving for recovery");
                return Ending::Interrupted;
            }

            let reservation = state.reservation.clone();
            let timeout = participant.timeout_or(self.config.default_step_timeout);
            let handler = participant.participant();
            let context = |attempt| run.context(id, attempt, reservation.clone());

            let outcome = undo(
                self.ports.error_handler(),
                run.execution.id,
                id,
                participant.retry_policy(),
                participant.retry_policy(),
                |attempt| {
                    let ctx = context(attempt);
                    async move {
                        match tokio::time::timeout(timeout, handler.cancel(&ctx)).await {
                            Ok(result) => result.map_err(|e| e.to_string()),
                            Err(_) => Err(format!("timed out after {timeout:?}")),
                        }
                    }
                },
            )
            .await;

            let halt = match &outcome.failure {
                None => false,
                Some((error, verdict)) => {
                    tracing::warn!(participant = id, error = %error, ?verdict, "Cancel failed");
                    metrics::counter!("tcc.cancel.failures").increment(1);
                    *verdict == CompensationVerdict::Halt
                }
            };
            run.update(&self.ports, |e| {
                if let Some(p) = e.participant_mut(id) {
                    p.attempts = outcome.attempts;
                    match &outcome.failure {
                        None => p.cancel_status = PhaseStatus::Succeeded,
                        Some((error, _)) => {
                            p.cancel_status = PhaseStatus::Failed;
                            p.last_error = Some(error.to_string());
                        }
                    }
                }
            })
            .await;

            if halt {
                tracing::warn!(execution_id = %run.execution.id, "Cancel chain halted");
                break;
            }
        }

        if run.lost.is_some() {
            return Ending::Interrupted;
        }

        let outstanding: Vec<&str> = run
            .execution
            .participants
            .iter()
            .filter(|p| {
                matches!(p.try_status, PhaseStatus::Succeeded | PhaseStatus::Running)
                    && p.cancel_status != PhaseStatus::Succeeded
            })
            .map(|p| p.participant_id.as_str())
            .collect();
        if outstanding.is_empty() {
            Ending::Cancelled
        } else {
            Ending::Incomplete(format!("cancel incomplete: reservations outstanding {outstanding:?}"))
        }
    }

    async fn conclude(&self, run: TccRun<'_>, ending: Ending) -> TccExecution {
        let definition = run.definition.name().to_string();
        let (mut execution, lost) = run.into_parts();
        let now = self.ports.clock().now();

        let failure = if let Some(error) = lost {
            Some(error)
        } else {
            let (status, message) = match ending {
                Ending::Interrupted => return execution,
                Ending::Confirmed => (TccStatus::Confirmed, None),
                Ending::Cancelled => (TccStatus::Cancelled, None),
                Ending::Incomplete(message) => (TccStatus::Failed, Some(message)),
            };
            execution.status = status;
            execution.ended_at = Some(now);
            if let Some(message) = message {
                execution.error.get_or_insert(message);
            }
            write_through(&self.ports, &mut execution).await.err()
        };

        if let Some(error) = failure {
            execution.status = TccStatus::Failed;
            execution.state_unknown = true;
            execution.error = Some(error.to_string());
            execution.ended_at = Some(now);
        }

        let event = match execution.status {
            TccStatus::Confirmed => {
                metrics::counter!("tcc.executions.confirmed").increment(1);
                LifecycleEvent::TccConfirmed {
                    execution_id: execution.id,
                    definition,
                }
            }
            TccStatus::Cancelled => {
                metrics::counter!("tcc.executions.cancelled").increment(1);
                LifecycleEvent::TccCancelled {
                    execution_id: execution.id,
                    definition,
                }
            }
            _ => {
                metrics::counter!("tcc.executions.failed").increment(1);
                LifecycleEvent::TccFailed {
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
            "TCC execution finished"
        );

        let acknowledged = emit_best_effort(self.ports.events().as_ref(), event).await;
        // Failed confirms still need the record for retry_confirm.
        let confirms_clean = execution
            .participants
            .iter()
            .all(|p| p.confirm_status != PhaseStatus::Failed);
        if acknowledged && self.config.retire_terminal_executions && !execution.state_unknown && confirms_clean {
            retire(&self.ports, &ExecutionRecord::Tcc(execution.clone())).await;
        }

        execution
    }
}

enum TryOutcome {
    Reserved,
    Refused,
    Interrupted,
}

enum Ending {
    Confirmed,
    Cancelled,
    Incomplete(String),
    Interrupted,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    total: Duration,
}

struct TccRun<'d> {
    definition: &'d TccDefinition,
    execution: TccExecution,
    input: Arc<Value>,
    lost: Option<PersistenceError>,
}

impl<'d> TccRun<'d> {
    fn new(definition: &'d TccDefinition, execution: TccExecution) -> Self {
        Self {
            definition,
            input: Arc::new(execution.input.clone()),
            execution,
            lost: None,
        }
    }

    fn context(&self, participant_id: &str, attempt: u32, reservation: Option<Value>) -> ParticipantContext {
        ParticipantContext {
            execution_id: self.execution.id,
            participant_id: participant_id.to_string(),
            attempt,
            input: Arc::clone(&self.input),
            reservation,
        }
    }

    /// Mutate the execution and write it through; stops persisting after the first failure.
    async fn update<R>(&mut self, ports: &EnginePorts, f: impl FnOnce(&mut TccExecution) -> R) -> R {
        let result = f(&mut self.execution);
        if self.lost.is_none() {
            if let Err(error) = write_through(ports, &mut self.execution).await {
                tracing::error!(execution_id = %self.execution.id, error = %error, "Halting execution: state is unknown");
                self.lost = Some(error);
            }
        }
        result
    }

    fn into_parts(self) -> (TccExecution, Option<PersistenceError>) {
        (self.execution, self.lost)
    }
}

/// Why a participant call failed.
#[derive(Debug)]
enum CallError {
    Handler(HandlerError),
    TimedOut(Duration),
    Deadline(Duration),
}

impl CallError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Handler(error) => error.is_retryable(),
            Self::TimedOut(_) => true,
            Self::Deadline(_) => false,
        }
    }

    fn into_participant_error(self, participant: &str, phase: TccPhase, attempts: u32) -> TccParticipantError {
        let participant = participant.to_string();
        match self {
            Self::Handler(error) => TccParticipantError::Failed {
                participant,
                phase,
                attempts,
                message: error.to_string(),
            },
            Self::TimedOut(timeout) => TccParticipantError::Timeout {
                participant,
                phase,
                timeout,
            },
            Self::Deadline(timeout) => TccParticipantError::GlobalTimeout { participant, timeout },
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handler(error) => write!(f, "{error}"),
            Self::TimedOut(timeout) => write!(f, "timed out after {timeout:?}"),
            Self::Deadline(timeout) => write!(f, "global deadline of {timeout:?} exceeded"),
        }
    }
}

/// One participant call, raced against its timeout and the global deadline if any.
///
/// The handler is not invoked at all once the deadline has passed.
async fn call<T>(
    timeout: Duration,
    deadline: Option<Deadline>,
    fut: impl Future<Output = Result<T, HandlerError>>,
) -> Result<T, CallError> {
    if let Some(passed) = deadline.filter(|d| d.at <= Instant::now()) {
        return Err(CallError::Deadline(passed.total));
    }

    let (limit, bounded_by_deadline) = match deadline {
        Some(deadline) => {
            let remaining = deadline.at.saturating_duration_since(Instant::now());
            if remaining < timeout {
                (remaining, true)
            } else {
                (timeout, false)
            }
        }
        None => (timeout, false),
    };

    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(CallError::Handler),
        Err(_) => match deadline {
            Some(deadline) if bounded_by_deadline => Err(CallError::Deadline(deadline.total)),
            _ => Err(CallError::TimedOut(timeout)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sagaflow_core::BoxFuture;
    use sagaflow_core::RetryPolicy;
    use sagaflow_core::handler::TccParticipant;
    use std::sync::Mutex;

    /// Reserves after `delay`, then confirms and cancels immediately.
    struct Slow {
        delay: Duration,
        calls: Mutex<Vec<&'static str>>,
    }

    impl TccParticipant for Slow {
        fn try_reserve<'a>(&'a self, _ctx: &'a ParticipantContext) -> BoxFuture<'a, Result<Option<Value>, HandlerError>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push("try");
                tokio::time::sleep(self.delay).await;
                Ok(Some(Value::from(1)))
            })
        }

        fn confirm<'a>(&'a self, _ctx: &'a ParticipantContext) -> BoxFuture<'a, Result<(), HandlerError>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push("confirm");
                Ok(())
            })
        }

        fn cancel<'a>(&'a self, ctx: &'a ParticipantContext) -> BoxFuture<'a, Result<(), HandlerError>> {
            Box::pin(async move {
                assert_eq!(ctx.reservation, Some(Value::from(1)));
                self.calls.lock().unwrap().push("cancel");
                Ok(())
            })
        }
    }

    fn slow(delay: Duration) -> Arc<Slow> {
        Arc::new(Slow {
            delay,
            calls: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_deadline_cancels_reserved() {
        let fast = slow(Duration::from_millis(100));
        let stuck = slow(Duration::from_secs(10));
        let definition = TccDefinition::builder("transfer")
            .participant(ParticipantDefinition::new("debit", fast.clone()))
            .participant(
                ParticipantDefinition::new("credit", stuck.clone())
                    .optional()
                    .retry(RetryPolicy::no_retry()),
            )
            .global_timeout(Duration::from_millis(500))
            .build()
            .unwrap();
        let engine = TccEngine::new(EnginePorts::in_memory(), EngineConfig::default());

        let execution = engine.execute(&definition, Value::Null).await.unwrap();

        assert_eq!(execution.status, TccStatus::Cancelled);
        assert_eq!(*fast.calls.lock().unwrap(), vec!["try", "cancel"]);
        assert_eq!(*stuck.calls.lock().unwrap(), vec!["try"]);
        let error = execution.participant("credit").unwrap().last_error.clone().unwrap();
        assert!(error.contains("Global try deadline"), "{error}");
    }

    #[tokio::test]
    async fn test_call_after_deadline_skips_handler() {
        let invoked = std::sync::atomic::AtomicBool::new(false);
        let deadline = Deadline {
            at: Instant::now(),
            total: Duration::from_millis(500),
        };

        let result = call(Duration::from_secs(1), Some(deadline), async {
            invoked.store(true, Ordering::SeqCst);
            Ok::<_, HandlerError>(())
        })
        .await;

        assert!(matches!(result, Err(CallError::Deadline(total)) if total == Duration::from_millis(500)));
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_resume_from_trying_cancels_reservations() {
        let debit = slow(Duration::ZERO);
        let credit = slow(Duration::ZERO);
        let definition = TccDefinition::builder("transfer")
            .participant(ParticipantDefinition::new("debit", debit.clone()))
            .participant(ParticipantDefinition::new("credit", credit.clone()))
            .build()
            .unwrap();

        let mut crashed = TccExecution::new(&definition, Value::Null, chrono::Utc::now());
        if let Some(p) = crashed.participant_mut("debit") {
            p.try_status = PhaseStatus::Succeeded;
            p.reservation = Some(Value::from(1));
        }

        let engine = TccEngine::new(EnginePorts::in_memory(), EngineConfig::default());
        let execution = engine.resume(&definition, crashed).await.unwrap();

        assert_eq!(execution.status, TccStatus::Cancelled);
        assert_eq!(*debit.calls.lock().unwrap(), vec!["cancel"]);
        assert!(credit.calls.lock().unwrap().is_empty());
    }
}
