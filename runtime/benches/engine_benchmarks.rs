//! Engine benchmarks
//!
//! - Definition build (validation + layering) for wide and deep graphs
//! - End-to-end Saga execution against the in-memory store
//! - Compensation of a failed Saga
//! - TCC round trip
//!
//! Run with: `cargo bench -p sagaflow-runtime`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use sagaflow_core::context::StepOutput;
use sagaflow_core::definition::{ParticipantDefinition, SagaDefinition, StepDefinition, TccDefinition};
use sagaflow_core::error::HandlerError;
use sagaflow_core::handler::{compensation_fn, step_fn};
use sagaflow_runtime::{EngineConfig, EnginePorts, SagaEngine, TccEngine};
use sagaflow_testing::{CallJournal, ScriptedParticipant};
use serde_json::json;
use std::sync::Arc;

fn noop(id: String) -> StepDefinition {
    StepDefinition::new(id, step_fn(|_| async { Ok(StepOutput::empty()) }))
        .compensate_with(compensation_fn(|_| async { Ok(()) }))
}

/// `width` independent steps feeding one sink.
fn fan_in(width: usize) -> SagaDefinition {
    let mut builder = SagaDefinition::builder("fan-in");
    let mut sink = noop("sink".to_string());
    for i in 0..width {
        let id = format!("s{i}");
        sink = sink.depends_on(id.clone());
        builder = builder.step(noop(id));
    }
    builder.step(sink).build().expect("valid definition")
}

/// A chain of `depth` steps.
fn chain(depth: usize) -> SagaDefinition {
    let mut builder = SagaDefinition::builder("chain");
    for i in 0..depth {
        let mut step = noop(format!("s{i}"));
        if i > 0 {
            step = step.depends_on(format!("s{}", i - 1));
        }
        builder = builder.step(step);
    }
    builder.build().expect("valid definition")
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

fn benchmark_definition_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("definition_build");

    for size in [10, 100, 500] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("fan_in", size), &size, |b, &size| {
            b.iter(|| black_box(fan_in(size)));
        });
        group.bench_with_input(BenchmarkId::new("chain", size), &size, |b, &size| {
            b.iter(|| black_box(chain(size)));
        });
    }

    group.finish();
}

fn benchmark_saga_execution(c: &mut Criterion) {
    let mut group = c.benchmark_group("saga_execution");
    group.throughput(Throughput::Elements(1));
    let runtime = runtime();

    for (name, definition) in [("fan_in_10", fan_in(10)), ("chain_10", chain(10))] {
        group.bench_function(name, |b| {
            let engine = SagaEngine::new(
                EnginePorts::in_memory(),
                EngineConfig::default().with_retire_terminal_executions(true),
            );
            b.to_async(&runtime).iter(|| async {
                let execution = engine
                    .execute(&definition, json!({}))
                    .await
                    .expect("admitted");
                black_box(execution);
            });
        });
    }

    let failing = {
        let mut builder = SagaDefinition::builder("unwind");
        for i in 0..10 {
            let mut step = noop(format!("s{i}"));
            if i > 0 {
                step = step.depends_on(format!("s{}", i - 1));
            }
            builder = builder.step(step);
        }
        builder
            .step(
                StepDefinition::new("boom", step_fn(|_| async { Err(HandlerError::permanent("boom")) }))
                    .depends_on("s9"),
            )
            .build()
            .expect("valid definition")
    };
    group.bench_function("compensate_10", |b| {
        let engine = SagaEngine::new(
            EnginePorts::in_memory(),
            EngineConfig::default().with_retire_terminal_executions(true),
        );
        b.to_async(&runtime).iter(|| async {
            black_box(engine.execute(&failing, json!({})).await.expect("admitted"));
        });
    });

    group.finish();
}

fn benchmark_tcc_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("tcc_round_trip");
    group.throughput(Throughput::Elements(1));
    let runtime = runtime();

    let journal = CallJournal::new();
    let transfer = TccDefinition::builder("transfer")
        .participant(ParticipantDefinition::new(
            "debit",
            Arc::new(ScriptedParticipant::new("debit", &journal)),
        ))
        .participant(ParticipantDefinition::new(
            "credit",
            Arc::new(ScriptedParticipant::new("credit", &journal)),
        ))
        .build()
        .expect("valid definition");

    group.bench_function("confirm_2", |b| {
        let engine = TccEngine::new(
            EnginePorts::in_memory(),
            EngineConfig::default().with_retire_terminal_executions(true),
        );
        b.to_async(&runtime).iter(|| async {
            black_box(engine.execute(&transfer, json!({})).await.expect("admitted"));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_definition_build,
    benchmark_saga_execution,
    benchmark_tcc_round_trip,
);
criterion_main!(benches);
