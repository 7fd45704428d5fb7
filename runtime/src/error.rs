//! Error types for the engines.

use sagaflow_core::backpressure::BackpressureRejected;
use sagaflow_core::persistence::PersistenceError;
use thiserror::Error;

/// Errors returned by the engine entry points.
///
/// Only admission-level problems are errors. Every transaction-level outcome,
/// persistence failures included, is an `Ok` execution record carrying its status
/// and manifest.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The backpressure controller refused the submission.
    ///
    /// No execution state exists for a rejected submission.
    #[error(transparent)]
    Rejected(#[from] BackpressureRejected),

    /// The engine is shutting down and not accepting new submissions.
    #[error("Engine is shutting down")]
    ShuttingDown,

    /// Shutdown timed out waiting for in-flight executions.
    #[error("Shutdown timed out with {0} executions still running")]
    ShutdownTimeout(usize),

    /// No definition is registered under the name.
    #[error("Unknown definition: {0}")]
    UnknownDefinition(String),

    /// Persistence failed outside of an execution (recovery, lookups).
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
