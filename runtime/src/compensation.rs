//! Compensation engine.
//!
//! Unwinds a failed Saga by running the undo action of every step that
//! succeeded and declares one, in reverse topological order. The
//! [`CompensationPolicy`] of the definition decides ordering, concurrency and
//! what a final failure does to the rest of the chain.

use crate::compensation_error::{CompensationVerdict, undo};
use crate::events::emit_best_effort;
use crate::saga::{Ending, SagaEngine, SagaRun};
use futures::future::join_all;
use sagaflow_core::RetryPolicy;
use sagaflow_core::context::CompensationContext;
use sagaflow_core::definition::CompensationPolicy;
use sagaflow_core::events::LifecycleEvent;
use sagaflow_core::execution::{SagaExecution, SagaStatus, StepStatus};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Sequential variants of the compensation chain.
#[derive(Debug, Clone, Copy)]
enum Chain {
    Strict,
    Retrying,
    Breaker(u32),
}

impl SagaEngine {
    /// Compensate every eligible step according to the definition's policy.
    pub(crate) async fn compensate(&self, run: &SagaRun<'_>) -> Ending {
        run.update(self.ports(), |e| e.status = SagaStatus::Compensating)
            .await;
        if run.persistence_lost() {
            return Ending::Interrupted;
        }

        let policy = run.definition.compensation_policy();
        let order: Vec<&str> = run
            .read(|e| {
                run.definition
                    .plan()
                    .reverse_order()
                    .into_iter()
                    .filter(|id| {
                        e.step(id).is_some_and(|s| {
                            s.compensable && matches!(s.status, StepStatus::Succeeded | StepStatus::Compensating)
                        })
                    })
                    .collect()
            })
            .await;

        tracing::info!(
            execution_id = %run.id,
            policy = %policy,
            eligible = order.len(),
            "Compensating saga"
        );
        metrics::counter!("saga.compensations.started").increment(1);

        match policy {
            CompensationPolicy::StrictSequential => self.compensate_chain(run, &order, Chain::Strict).await,
            CompensationPolicy::RetryWithBackoff => self.compensate_chain(run, &order, Chain::Retrying).await,
            CompensationPolicy::CircuitBreaker { failure_threshold } => {
                self.compensate_chain(run, &order, Chain::Breaker(failure_threshold))
                    .await;
            }
            CompensationPolicy::GroupedParallel => self.compensate_grouped(run, &order).await,
            CompensationPolicy::BestEffortParallel => {
                join_all(order.iter().map(|id| self.compensate_step(run, id, None))).await;
            }
        }

        if run.persistence_lost() {
            return Ending::Interrupted;
        }

        let manifest = run.read(SagaExecution::manifest).await;
        if manifest.is_clean() {
            Ending::Compensated
        } else {
            Ending::Incomplete(format!(
                "compensation incomplete: uncompensated {:?}, skipped {:?}",
                manifest.uncompensated, manifest.skipped
            ))
        }
    }

    async fn compensate_chain(&self, run: &SagaRun<'_>, order: &[&str], chain: Chain) {
        let mut consecutive_failures = 0;

        for (index, step_id) in order.iter().enumerate() {
            if run.persistence_lost() {
                return;
            }

            let Some(verdict) = self.compensate_step(run, step_id, Some(chain)).await else {
                consecutive_failures = 0;
                continue;
            };
            consecutive_failures += 1;

            let halt = match chain {
                // A failed undo may not be skipped past.
                Chain::Strict => true,
                Chain::Retrying | Chain::Breaker(_) => verdict == CompensationVerdict::Halt,
            };
            if halt {
                tracing::warn!(execution_id = %run.id, step_id, "Compensation chain halted");
                return;
            }

            if let Chain::Breaker(threshold) = chain {
                if consecutive_failures >= threshold {
                    let rest = &order[index + 1..];
                    tracing::warn!(
                        execution_id = %run.id,
                        consecutive_failures,
                        skipped = rest.len(),
                        "Compensation circuit open; skipping remaining steps"
                    );
                    metrics::counter!("saga.compensations.skipped").increment(rest.len() as u64);
                    run.update(self.ports(), |e| {
                        for id in rest {
                            if let Some(record) = e.step_mut(id) {
                                record.status = StepStatus::Skipped;
                            }
                        }
                    })
                    .await;
                    return;
                }
            }
        }
    }

    async fn compensate_grouped(&self, run: &SagaRun<'_>, order: &[&str]) {
        let plan = run.definition.plan();
        let semaphore = Semaphore::new(run.definition.layer_concurrency());

        for layer in (0..plan.layers().len()).rev() {
            let group: Vec<&str> = order
                .iter()
                .copied()
                .filter(|id| plan.layer_of(id) == Some(layer))
                .collect();
            if group.is_empty() {
                continue;
            }

            let verdicts = join_all(group.iter().map(|id| async {
                let Ok(_permit) = semaphore.acquire().await else {
                    return None;
                };
                self.compensate_step(run, id, None).await
            }))
            .await;

            if run.persistence_lost() {
                return;
            }
            if verdicts.contains(&Some(CompensationVerdict::Halt)) {
                tracing::warn!(execution_id = %run.id, layer, "Compensation halted; later groups not dispatched");
                return;
            }
        }
    }

    /// Undo one step. Returns `None` on success, else the handler's final verdict.
    async fn compensate_step(
        &self,
        run: &SagaRun<'_>,
        step_id: &str,
        chain: Option<Chain>,
    ) -> Option<CompensationVerdict> {
        let step = run.definition.step(step_id)?;
        let handler = step.compensation()?;

        let (output, variables, prior_attempts) = run
            .update(self.ports(), |e| {
                let variables = e.variables.clone();
                e.step_mut(step_id).map_or((None, variables.clone(), 0), |record| {
                    record.status = StepStatus::Compensating;
                    (record.output.clone(), variables, record.compensation_attempts)
                })
            })
            .await;
        if run.persistence_lost() {
            return Some(CompensationVerdict::Halt);
        }

        let per_round = match chain {
            Some(Chain::Retrying) => *step.retry_policy(),
            _ => RetryPolicy::no_retry(),
        };
        let timeout = step.timeout_or(self.config().default_step_timeout);

        let outcome = undo(
            self.ports().error_handler(),
            run.id,
            step_id,
            &per_round,
            step.retry_policy(),
            |attempt| {
                let ctx = CompensationContext {
                    execution_id: run.id,
                    step_id: step_id.to_string(),
                    attempt: prior_attempts + attempt,
                    input: Arc::clone(&run.input),
                    output: output.clone(),
                    variables: variables.clone(),
                };
                async move {
                    match tokio::time::timeout(timeout, handler.compensate(&ctx)).await {
                        Ok(result) => result.map_err(|e| e.to_string()),
                        Err(_) => Err(format!("timed out after {timeout:?}")),
                    }
                }
            },
        )
        .await;

        let now = self.ports().clock().now();
        let failure = outcome.failure;
        run.update(self.ports(), |e| {
            if let Some(record) = e.step_mut(step_id) {
                record.compensation_attempts = prior_attempts + outcome.attempts;
                record.ended_at = Some(now);
                match &failure {
                    None => {
                        record.status = StepStatus::Compensated;
                        record.compensation_error = None;
                    }
                    Some((error, _)) => {
                        record.status = StepStatus::Succeeded;
                        record.compensation_error = Some(error.to_string());
                    }
                }
            }
        })
        .await;

        match failure {
            None => {
                tracing::debug!(execution_id = %run.id, step_id, "Step compensated");
                metrics::counter!("saga.compensations.succeeded").increment(1);
                emit_best_effort(
                    self.ports().events().as_ref(),
                    LifecycleEvent::StepCompensated {
                        execution_id: run.id,
                        step_id: step_id.to_string(),
                    },
                )
                .await;
                None
            }
            Some((error, verdict)) => {
                tracing::warn!(execution_id = %run.id, step_id, error = %error, ?verdict, "Compensation failed");
                metrics::counter!("saga.compensations.failed").increment(1);
                Some(verdict)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::compensation_error::CompensationErrorHandler;
    use crate::config::EngineConfig;
    use crate::engine::EnginePorts;
    use crate::saga::SagaEngine;
    use sagaflow_core::context::StepOutput;
    use sagaflow_core::definition::{CompensationPolicy, SagaDefinition, StepDefinition};
    use sagaflow_core::error::HandlerError;
    use sagaflow_core::execution::{SagaStatus, StepStatus};
    use sagaflow_core::handler::{compensation_fn, step_fn};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn saga(policy: CompensationPolicy, journal: &Arc<Mutex<Vec<String>>>, failing_undo: &'static str) -> SagaDefinition {
        let mut builder = SagaDefinition::builder("unwind").compensation_policy(policy);
        for id in ["a", "b", "c"] {
            let journal = Arc::clone(journal);
            builder = builder.step(
                StepDefinition::new(id, step_fn(|_| async { Ok(StepOutput::empty()) })).compensate_with(
                    compensation_fn(move |ctx| {
                        let journal = Arc::clone(&journal);
                        async move {
                            journal.lock().unwrap().push(ctx.step_id.clone());
                            if ctx.step_id == failing_undo {
                                Err(HandlerError::new("undo failed"))
                            } else {
                                Ok(())
                            }
                        }
                    }),
                ),
            );
        }
        builder
            .step(
                StepDefinition::new("boom", step_fn(|_| async { Err(HandlerError::permanent("boom")) }))
                    .depends_on("a")
                    .depends_on("b")
                    .depends_on("c"),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_strict_sequential_halts_on_first_failure() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let definition = saga(CompensationPolicy::StrictSequential, &journal, "c");
        let engine = SagaEngine::new(EnginePorts::in_memory(), EngineConfig::default());

        let execution = engine.execute(&definition, json!({})).await.unwrap();

        // Reverse declaration order within the layer: c first, then the chain stops.
        assert_eq!(*journal.lock().unwrap(), vec!["c"]);
        assert_eq!(execution.status, SagaStatus::Failed);
        assert_eq!(execution.manifest().uncompensated, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_and_continue_goes_past_failure() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let definition = saga(CompensationPolicy::RetryWithBackoff, &journal, "c");
        let ports = EnginePorts::in_memory().with_error_handler(CompensationErrorHandler::LogAndContinue);
        let engine = SagaEngine::new(ports, EngineConfig::default());

        let execution = engine.execute(&definition, json!({})).await.unwrap();

        assert_eq!(execution.status, SagaStatus::Failed);
        assert_eq!(execution.step("a").unwrap().status, StepStatus::Compensated);
        assert_eq!(execution.step("b").unwrap().status, StepStatus::Compensated);
        assert!(execution.step("c").unwrap().compensation_error.is_some());
        assert_eq!(execution.manifest().uncompensated, vec!["c"]);
    }

    #[tokio::test]
    async fn test_best_effort_dispatches_everything() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let definition = saga(CompensationPolicy::BestEffortParallel, &journal, "b");
        let ports = EnginePorts::in_memory().with_error_handler(CompensationErrorHandler::FailFast);
        let engine = SagaEngine::new(ports, EngineConfig::default());

        let execution = engine.execute(&definition, json!({})).await.unwrap();

        let mut undone = journal.lock().unwrap().clone();
        undone.sort();
        assert_eq!(undone, vec!["a", "b", "c"]);
        assert_eq!(execution.manifest().compensated, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_grouped_parallel_compensates_whole_layer() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let definition = saga(CompensationPolicy::GroupedParallel, &journal, "none");
        let engine = SagaEngine::new(EnginePorts::in_memory(), EngineConfig::default());

        let execution = engine.execute(&definition, json!({})).await.unwrap();

        assert_eq!(execution.status, SagaStatus::Compensated);
        assert_eq!(journal.lock().unwrap().len(), 3);
        let manifest = execution.manifest();
        assert!(manifest.is_clean());
        assert_eq!(manifest.compensated, vec!["a", "b", "c"]);
        assert_eq!(manifest.failed, vec!["boom"]);
    }
}
