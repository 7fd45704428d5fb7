//! # Sagaflow Runtime
//!
//! Engines that drive the definitions of `sagaflow-core` to completion.
//!
//! ## Core Components
//!
//! - **Saga engine**: Runs a DAG of steps layer by layer with bounded concurrency,
//!   retries with backoff, and hands failures to the compensation engine
//! - **Compensation engine**: Unwinds succeeded steps under one of five policies
//! - **TCC engine**: Coordinates Try, Confirm and Cancel across participants
//! - **Backpressure**: Adaptive, batched, circuit-breaker and unbounded admission
//! - **Recovery**: Resumes executions abandoned by a crashed process
//! - **Orchestrator**: Facade over both engines, a definition registry and recovery
//!
//! ## Example
//!
//! ```
//! use sagaflow_core::context::StepOutput;
//! use sagaflow_core::definition::{SagaDefinition, StepDefinition};
//! use sagaflow_core::error::HandlerError;
//! use sagaflow_core::execution::SagaStatus;
//! use sagaflow_core::handler::{compensation_fn, step_fn};
//! use sagaflow_runtime::{EngineConfig, EnginePorts, SagaEngine};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let saga = SagaDefinition::builder("checkout")
//!     .step(
//!         StepDefinition::new("reserve", step_fn(|_| async { Ok(StepOutput::empty()) }))
//!             .compensate_with(compensation_fn(|_| async { Ok(()) })),
//!     )
//!     .step(
//!         StepDefinition::new("charge", step_fn(|_| async {
//!             Err(HandlerError::permanent("card declined"))
//!         }))
//!         .depends_on("reserve"),
//!     )
//!     .build()?;
//!
//! let engine = SagaEngine::new(EnginePorts::in_memory(), EngineConfig::default());
//! let execution = engine.execute(&saga, json!({ "order": 7 })).await?;
//!
//! assert_eq!(execution.status, SagaStatus::Compensated);
//! assert_eq!(execution.manifest().compensated, vec!["reserve"]);
//! # Ok(())
//! # }
//! ```

/// Admission control strategies
pub mod backpressure;

/// Circuit breaker pattern for preventing cascading failures
pub mod circuit_breaker;

/// Saga compensation policies
mod compensation;

/// Compensation-error handlers and verdicts
pub mod compensation_error;

/// Engine configuration
pub mod config;

/// Ports, shutdown tracking and write-through persistence
pub mod engine;

/// Error types for the engines
pub mod error;

/// Event sinks and best-effort delivery
pub mod events;

/// Prometheus metrics for observability
pub mod metrics;

/// Facade over both engines
pub mod orchestrator;

/// In-memory execution store
pub mod persistence;

/// Recovery of abandoned executions
pub mod recovery;

/// Definitions by name
pub mod registry;

/// Retry logic with exponential backoff
pub mod retry;

/// Saga execution engine
pub mod saga;

/// Try-Confirm-Cancel execution engine
pub mod tcc;

pub use backpressure::BackpressureStrategy;
pub use compensation_error::CompensationErrorHandler;
pub use config::EngineConfig;
pub use engine::{EnginePorts, ShutdownSignal};
pub use error::EngineError;
pub use orchestrator::Orchestrator;
pub use persistence::InMemoryExecutionStore;
pub use saga::SagaEngine;
pub use tcc::TccEngine;
