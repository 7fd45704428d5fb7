//! Integration tests for the Saga and compensation engines.
//!
//! Handlers come from `sagaflow-testing`; every invocation lands in a shared
//! journal so call order can be asserted across steps and compensations.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use sagaflow_core::RetryPolicy;
use sagaflow_core::definition::{CompensationPolicy, SagaDefinition, StepDefinition};
use sagaflow_core::execution::{SagaStatus, StepStatus};
use sagaflow_core::persistence::ExecutionStore;
use sagaflow_runtime::compensation_error::CompensationErrorHandler;
use sagaflow_runtime::config::EngineConfig;
use sagaflow_runtime::engine::EnginePorts;
use sagaflow_runtime::persistence::InMemoryExecutionStore;
use sagaflow_runtime::saga::SagaEngine;
use sagaflow_testing::{
    CallJournal, FailingEventSink, FailingExecutionStore, RecordingCompensation, RecordingEventSink,
    ScriptedStep, init_tracing,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn step(id: &str, journal: &CallJournal) -> StepDefinition {
    StepDefinition::new(id, Arc::new(ScriptedStep::new(id, journal)))
        .compensate_with(Arc::new(RecordingCompensation::new(id, journal)))
}

fn failing(id: &str, journal: &CallJournal) -> StepDefinition {
    StepDefinition::new(
        id,
        Arc::new(ScriptedStep::new(id, journal).always_failing().permanent()),
    )
}

#[tokio::test]
async fn test_diamond_runs_layer_by_layer() {
    init_tracing();
    let journal = CallJournal::new();
    let saga = SagaDefinition::builder("diamond")
        .step(step("d", &journal).depends_on("b").depends_on("c"))
        .step(step("b", &journal).depends_on("a"))
        .step(step("c", &journal).depends_on("a"))
        .step(step("a", &journal))
        .build()
        .unwrap();

    let engine = SagaEngine::new(EnginePorts::in_memory(), EngineConfig::default());
    let execution = engine.execute(&saga, json!({"order": 7})).await.unwrap();

    assert_eq!(execution.status, SagaStatus::Completed);
    assert!(execution.manifest().is_clean());

    let layer = |id: &str| execution.step(id).unwrap().layer;
    assert_eq!(layer("a"), 0);
    assert_eq!(layer("b"), 1);
    assert_eq!(layer("c"), 1);
    assert_eq!(layer("d"), 2);

    let entries = journal.entries();
    assert_eq!(entries.first().map(String::as_str), Some("step:a"));
    assert_eq!(entries.last().map(String::as_str), Some("step:d"));
    assert_eq!(entries.len(), 4);
}

#[tokio::test]
async fn test_failure_compensates_completed_steps_once() {
    let journal = CallJournal::new();
    let events = Arc::new(RecordingEventSink::new());
    let saga = SagaDefinition::builder("checkout")
        .step(step("reserve", &journal))
        .step(failing("charge", &journal).depends_on("reserve"))
        .build()
        .unwrap();

    let engine = SagaEngine::new(
        EnginePorts::in_memory().with_events(events.clone()),
        EngineConfig::default(),
    );
    let execution = engine.execute(&saga, json!({})).await.unwrap();

    assert_eq!(execution.status, SagaStatus::Compensated);
    assert_eq!(
        journal.entries(),
        vec!["step:reserve", "step:charge", "compensate:reserve"]
    );

    let manifest = execution.manifest();
    assert_eq!(manifest.compensated, vec!["reserve"]);
    assert_eq!(manifest.failed, vec!["charge"]);
    assert!(execution.error.unwrap().contains("charge"));

    assert_eq!(
        events.names(),
        vec![
            "SagaStarted",
            "StepCompleted",
            "StepFailed",
            "StepCompensated",
            "SagaCompensated"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_retry_waits_exponential_backoff() {
    let journal = CallJournal::new();
    let flaky = Arc::new(ScriptedStep::new("flaky", &journal).failing_first(2));
    let saga = SagaDefinition::builder("retrying")
        .step(
            StepDefinition::new("flaky", flaky.clone()).retry(
                RetryPolicy::new()
                    .with_max_attempts(3)
                    .with_base_delay(Duration::from_millis(100))
                    .with_jitter(false),
            ),
        )
        .build()
        .unwrap();

    let engine = SagaEngine::new(EnginePorts::in_memory(), EngineConfig::default());
    let execution = engine.execute(&saga, json!({})).await.unwrap();

    assert_eq!(execution.status, SagaStatus::Completed);
    assert_eq!(execution.step("flaky").unwrap().attempts, 3);
    assert_eq!(
        flaky.gaps(),
        vec![Duration::from_millis(100), Duration::from_millis(200)]
    );
}

#[tokio::test]
async fn test_circuit_breaker_skips_after_consecutive_failures() {
    let journal = CallJournal::new();
    let undo_fails = |id: &str| {
        StepDefinition::new(id, Arc::new(ScriptedStep::new(id, &journal)))
            .compensate_with(Arc::new(RecordingCompensation::new(id, &journal).always_failing()))
    };
    let saga = SagaDefinition::builder("breaker")
        .step(step("a", &journal))
        .step(step("b", &journal).depends_on("a"))
        .step(undo_fails("c").depends_on("b"))
        .step(undo_fails("d").depends_on("c"))
        .step(failing("e", &journal).depends_on("d"))
        .compensation_policy(CompensationPolicy::CircuitBreaker { failure_threshold: 2 })
        .build()
        .unwrap();

    let engine = SagaEngine::new(EnginePorts::in_memory(), EngineConfig::default());
    let execution = engine.execute(&saga, json!({})).await.unwrap();

    assert_eq!(execution.status, SagaStatus::Failed);
    assert_eq!(journal.with_prefix("compensate:"), vec!["compensate:d", "compensate:c"]);

    let manifest = execution.manifest();
    assert_eq!(manifest.uncompensated, vec!["c", "d"]);
    assert_eq!(manifest.skipped, vec!["a", "b"]);
    assert!(execution.error.unwrap().contains("compensation incomplete"));
}

#[tokio::test(start_paused = true)]
async fn test_fail_fast_handler_halts_compensation_chain() {
    let journal = CallJournal::new();
    let saga = SagaDefinition::builder("fail-fast")
        .step(step("a", &journal))
        .step(
            StepDefinition::new("b", Arc::new(ScriptedStep::new("b", &journal)))
                .compensate_with(Arc::new(RecordingCompensation::new("b", &journal).always_failing()))
                .depends_on("a"),
        )
        .step(failing("c", &journal).depends_on("b"))
        .compensation_policy(CompensationPolicy::RetryWithBackoff)
        .build()
        .unwrap();

    let ports = EnginePorts::in_memory().with_error_handler(CompensationErrorHandler::FailFast);
    let engine = SagaEngine::new(ports, EngineConfig::default());
    let execution = engine.execute(&saga, json!({})).await.unwrap();

    assert_eq!(execution.status, SagaStatus::Failed);
    assert_eq!(journal.count("compensate:b"), 3);
    assert_eq!(journal.count("compensate:a"), 0);
    assert_eq!(execution.step("b").unwrap().status, StepStatus::Succeeded);
    assert!(execution.step("b").unwrap().compensation_error.is_some());
    assert_eq!(execution.manifest().uncompensated, vec!["a", "b"]);
}

#[tokio::test]
async fn test_lost_persistence_marks_state_unknown() {
    let journal = CallJournal::new();
    let inner = Arc::new(InMemoryExecutionStore::new());
    let store = Arc::new(FailingExecutionStore::new(inner.clone(), 2));
    let saga = SagaDefinition::builder("fragile")
        .step(step("a", &journal))
        .step(step("b", &journal).depends_on("a"))
        .build()
        .unwrap();

    let engine = SagaEngine::new(EnginePorts::new(store), EngineConfig::default());
    let execution = engine.execute(&saga, json!({})).await.unwrap();

    assert_eq!(execution.status, SagaStatus::Failed);
    assert!(execution.state_unknown);
    assert_eq!(journal.count("step:b"), 0);

    // The last good write stays behind for recovery.
    let stored = inner
        .load(execution.id)
        .await
        .unwrap()
        .expect("execution should still be stored");
    assert_eq!(stored.status_name(), "RUNNING");
    assert_eq!(stored.revision(), 2);
}

#[tokio::test]
async fn test_event_sink_failure_is_tolerated() {
    let journal = CallJournal::new();
    let store = Arc::new(InMemoryExecutionStore::new());
    let saga = SagaDefinition::builder("quiet")
        .step(step("a", &journal))
        .build()
        .unwrap();

    let engine = SagaEngine::new(
        EnginePorts::new(store.clone()).with_events(Arc::new(FailingEventSink)),
        EngineConfig::default().with_retire_terminal_executions(true),
    );
    let execution = engine.execute(&saga, json!({})).await.unwrap();

    assert_eq!(execution.status, SagaStatus::Completed);
    // Not retired: the terminal event was never acknowledged.
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_acknowledged_terminal_execution_is_retired() {
    let journal = CallJournal::new();
    let store = Arc::new(InMemoryExecutionStore::new());
    let saga = SagaDefinition::builder("retired")
        .step(step("a", &journal))
        .build()
        .unwrap();

    let engine = SagaEngine::new(
        EnginePorts::new(store.clone()).with_events(Arc::new(RecordingEventSink::new())),
        EngineConfig::default().with_retire_terminal_executions(true),
    );
    let execution = engine.execute(&saga, json!({})).await.unwrap();

    assert_eq!(execution.status, SagaStatus::Completed);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_headers_reach_handlers() {
    let saga = SagaDefinition::builder("headers")
        .step(StepDefinition::new(
            "echo",
            sagaflow_core::handler::step_fn(|ctx| async move {
                let tenant = ctx.header("tenant").unwrap_or_default().to_string();
                Ok(sagaflow_core::context::StepOutput::with_output(json!(tenant)))
            }),
        ))
        .build()
        .unwrap();

    let engine = SagaEngine::new(EnginePorts::in_memory(), EngineConfig::default());
    let headers = [("tenant".to_string(), "acme".to_string())].into_iter().collect();
    let execution = engine
        .execute_with_headers(&saga, json!({}), headers)
        .await
        .unwrap();

    assert_eq!(execution.step("echo").unwrap().output, Some(json!("acme")));
}

#[tokio::test(start_paused = true)]
async fn test_slow_sibling_finishes_before_compensation() {
    let journal = CallJournal::new();
    let events = Arc::new(RecordingEventSink::new());
    let slow = Arc::new(ScriptedStep::new("slow", &journal).with_delay(Duration::from_millis(500)));
    let saga = SagaDefinition::builder("barrier")
        .step(
            StepDefinition::new("slow", slow.clone())
                .compensate_with(Arc::new(RecordingCompensation::new("slow", &journal))),
        )
        .step(failing("fast", &journal))
        .build()
        .unwrap();

    let engine = SagaEngine::new(
        EnginePorts::in_memory().with_events(events.clone()),
        EngineConfig::default(),
    );
    let execution = engine.execute(&saga, json!({})).await.unwrap();

    assert_eq!(execution.status, SagaStatus::Compensated);
    assert_eq!(slow.calls(), 1);
    let entries = journal.entries();
    assert_eq!(entries.len(), 3);
    assert!(entries[..2].contains(&"step:fast".to_string()));
    assert_eq!(entries[2], "compensate:slow");
    assert_eq!(execution.step("slow").unwrap().status, StepStatus::Compensated);
    assert_eq!(
        events.names(),
        vec![
            "SagaStarted",
            "StepFailed",
            "StepCompleted",
            "StepCompensated",
            "SagaCompensated"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_backing_off_sibling_stops_retrying_once_halted() {
    let journal = CallJournal::new();
    let flaky = Arc::new(ScriptedStep::new("flaky", &journal).always_failing());
    let saga = SagaDefinition::builder("halted")
        .step(
            StepDefinition::new("flaky", flaky.clone()).retry(
                RetryPolicy::new()
                    .with_max_attempts(3)
                    .with_base_delay(Duration::from_secs(1))
                    .with_jitter(false),
            ),
        )
        .step(StepDefinition::new(
            "doomed",
            Arc::new(
                ScriptedStep::new("doomed", &journal)
                    .with_delay(Duration::from_millis(10))
                    .always_failing()
                    .permanent(),
            ),
        ))
        .build()
        .unwrap();

    let engine = SagaEngine::new(EnginePorts::in_memory(), EngineConfig::default());
    let execution = engine.execute(&saga, json!({})).await.unwrap();

    assert_eq!(flaky.calls(), 1);
    assert_eq!(execution.status, SagaStatus::Compensated);
    let record = execution.step("flaky").unwrap();
    assert_eq!(record.status, StepStatus::Failed);
    assert_eq!(record.attempts, 1);
    assert!(execution.error.unwrap().contains("doomed"));
}

#[tokio::test(start_paused = true)]
async fn test_layer_concurrency_bounds_running_handlers() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let tracked = |id: String| {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        StepDefinition::new(
            id,
            sagaflow_core::handler::step_fn(move |_| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let running = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(running, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(sagaflow_core::context::StepOutput::empty())
                }
            }),
        )
    };

    let mut builder = SagaDefinition::builder("bounded").layer_concurrency(2);
    for i in 0..6 {
        builder = builder.step(tracked(format!("s{i}")));
    }
    let saga = builder.build().unwrap();

    let engine = SagaEngine::new(EnginePorts::in_memory(), EngineConfig::default());
    let started = tokio::time::Instant::now();
    let execution = engine.execute(&saga, json!({})).await.unwrap();

    assert_eq!(execution.status, SagaStatus::Completed);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn test_grouped_parallel_undoes_layers_in_reverse() {
    let journal = CallJournal::new();
    let saga = SagaDefinition::builder("grouped")
        .step(step("a", &journal))
        .step(step("b", &journal).depends_on("a"))
        .step(step("c", &journal).depends_on("a"))
        .step(failing("d", &journal).depends_on("b").depends_on("c"))
        .compensation_policy(CompensationPolicy::GroupedParallel)
        .build()
        .unwrap();

    let engine = SagaEngine::new(EnginePorts::in_memory(), EngineConfig::default());
    let execution = engine.execute(&saga, json!({})).await.unwrap();

    assert_eq!(execution.status, SagaStatus::Compensated);
    let undone = journal.with_prefix("compensate:");
    assert_eq!(undone.len(), 3);
    let mut upper = undone[..2].to_vec();
    upper.sort();
    assert_eq!(upper, vec!["compensate:b", "compensate:c"]);
    assert_eq!(undone[2], "compensate:a");
}

#[tokio::test]
async fn test_grouped_parallel_halt_stops_later_groups() {
    let journal = CallJournal::new();
    let saga = SagaDefinition::builder("grouped-halt")
        .step(step("a", &journal))
        .step(
            StepDefinition::new("b", Arc::new(ScriptedStep::new("b", &journal)))
                .compensate_with(Arc::new(RecordingCompensation::new("b", &journal).always_failing()))
                .depends_on("a"),
        )
        .step(step("c", &journal).depends_on("a"))
        .step(failing("d", &journal).depends_on("b").depends_on("c"))
        .compensation_policy(CompensationPolicy::GroupedParallel)
        .build()
        .unwrap();

    let ports = EnginePorts::in_memory().with_error_handler(CompensationErrorHandler::FailFast);
    let engine = SagaEngine::new(ports, EngineConfig::default());
    let execution = engine.execute(&saga, json!({})).await.unwrap();

    assert_eq!(execution.status, SagaStatus::Failed);
    assert_eq!(journal.count("compensate:b"), 1);
    assert_eq!(journal.count("compensate:c"), 1);
    assert_eq!(journal.count("compensate:a"), 0);

    let manifest = execution.manifest();
    assert_eq!(manifest.compensated, vec!["c"]);
    assert_eq!(manifest.uncompensated, vec!["a", "b"]);
}
