//! # Sagaflow Core
//!
//! Core types and port traits for orchestrating distributed transactions with the
//! Saga and Try-Confirm-Cancel (TCC) patterns.
//!
//! This crate is pure: it describes *what* a transaction is and *where* the engine
//! talks to the outside world, but contains no scheduling logic. The engines live in
//! `sagaflow-runtime`.
//!
//! ## Core Concepts
//!
//! - **Definition**: Immutable description of a Saga (a DAG of steps with compensations)
//!   or a TCC transaction (an ordered list of participants)
//! - **Plan**: Topological layering of a Saga's steps, computed once at build time
//! - **Execution**: The mutable record of one run, persisted after every transition
//! - **Ports**: Persistence, events, backpressure and clock abstractions
//!
//! ## Example
//!
//! ```
//! use sagaflow_core::definition::{SagaDefinition, StepDefinition, CompensationPolicy};
//! use sagaflow_core::handler::{step_fn, compensation_fn};
//! use sagaflow_core::context::StepOutput;
//!
//! # fn main() -> Result<(), sagaflow_core::error::DefinitionError> {
//! let saga = SagaDefinition::builder("checkout")
//!     .step(
//!         StepDefinition::new("reserve-stock", step_fn(|_ctx| async {
//!             Ok(StepOutput::empty())
//!         }))
//!         .compensate_with(compensation_fn(|_ctx| async { Ok(()) })),
//!     )
//!     .step(
//!         StepDefinition::new("charge-card", step_fn(|_ctx| async {
//!             Ok(StepOutput::empty())
//!         }))
//!         .depends_on("reserve-stock"),
//!     )
//!     .compensation_policy(CompensationPolicy::StrictSequential)
//!     .build()?;
//!
//! assert_eq!(saga.plan().layers().len(), 2);
//! # Ok(())
//! # }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde_json::Value;

/// Backpressure port: admission control in front of the engines
pub mod backpressure;

/// Read-only execution context handed to handlers
pub mod context;

/// Saga and TCC definition model with fluent builders
pub mod definition;

/// Clock abstraction for testable time
pub mod environment;

/// Error taxonomy shared by every engine
pub mod error;

/// Lifecycle events and the events port
pub mod events;

/// Execution records, statuses and manifests
pub mod execution;

/// Step, compensation and TCC participant handler traits
pub mod handler;

/// Execution identifiers
pub mod id;

/// Persistence port for execution records
pub mod persistence;

/// DAG planner computing topological layers
pub mod planner;

/// Retry policy description
pub mod retry;

use std::future::Future;
use std::pin::Pin;

/// Boxed, `Send` future returned by every dyn-compatible trait in this crate.
///
/// Handler and port traits return `Pin<Box<dyn Future>>` instead of using `async fn`
/// so they can be stored as `Arc<dyn Trait>` inside definitions and engines.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use definition::{
    CompensationPolicy, ExecutionMode, ParticipantDefinition, SagaDefinition, StepDefinition,
    TccDefinition,
};
pub use error::{DefinitionError, HandlerError, StepError};
pub use execution::{
    ExecutionManifest, ExecutionRecord, PhaseStatus, SagaExecution, SagaStatus, StepExecution,
    StepStatus, TccExecution, TccStatus,
};
pub use id::ExecutionId;
pub use retry::RetryPolicy;
