//! # Sagaflow Testing
//!
//! Test doubles for exercising the Sagaflow engines deterministically.
//!
//! This crate provides:
//! - Clocks with pinned or manually advanced time
//! - Scripted step, compensation and TCC participant handlers that record every
//!   call into a shared [`CallJournal`]
//! - A recording event sink, a failing event sink and a store that fails on demand
//!
//! ## Example
//!
//! ```
//! use sagaflow_core::definition::{SagaDefinition, StepDefinition};
//! use sagaflow_testing::{CallJournal, RecordingCompensation, ScriptedStep};
//! use std::sync::Arc;
//!
//! let journal = CallJournal::new();
//! let reserve = Arc::new(ScriptedStep::new("reserve", &journal));
//!
//! let saga = SagaDefinition::builder("checkout")
//!     .step(
//!         StepDefinition::new("reserve", reserve.clone())
//!             .compensate_with(Arc::new(RecordingCompensation::new("reserve", &journal))),
//!     )
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(saga.steps().len(), 1);
//! assert!(journal.entries().is_empty());
//! ```

/// Scripted handlers and the call journal
pub mod handlers;

/// Deterministic clocks
pub mod mocks;

/// Recording and failing port implementations
pub mod ports;

pub use handlers::{CallJournal, RecordingCompensation, ScriptedParticipant, ScriptedStep};
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use ports::{FailingEventSink, FailingExecutionStore, RecordingEventSink};

/// Install a `tracing` subscriber for test output, once per process.
///
/// Honors `RUST_LOG`; defaults to `warn`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
