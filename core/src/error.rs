//! Error taxonomy for definitions, handlers, steps and participants.
//!
//! Port-specific errors live next to their port: [`PersistenceError`] in
//! [`crate::persistence`], [`BackpressureRejected`] in [`crate::backpressure`] and
//! [`EventSinkError`] in [`crate::events`].
//!
//! [`PersistenceError`]: crate::persistence::PersistenceError
//! [`BackpressureRejected`]: crate::backpressure::BackpressureRejected
//! [`EventSinkError`]: crate::events::EventSinkError

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors detected while building a definition.
///
/// These are rejected synchronously, before any execution is created.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    /// A definition without steps or participants.
    #[error("Definition '{definition}' has no steps")]
    Empty {
        /// Name of the offending definition
        definition: String,
    },

    /// Two steps (or participants) share the same id.
    #[error("Duplicate id '{id}' in definition '{definition}'")]
    DuplicateId {
        /// Name of the offending definition
        definition: String,
        /// The repeated id
        id: String,
    },

    /// A step depends on an id that is not declared in the same definition.
    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        /// The step declaring the dependency
        step: String,
        /// The id that could not be resolved
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    ///
    /// `path` lists the step ids along the cycle, starting and ending at the same id.
    #[error("Cycle detected in step graph: {}", path.join(" -> "))]
    CycleDetected {
        /// Step ids forming the cycle
        path: Vec<String>,
    },

    /// The layer concurrency limit must be at least 1.
    #[error("Definition '{definition}' has a layer concurrency limit of zero")]
    InvalidConcurrency {
        /// Name of the offending definition
        definition: String,
    },
}

/// Error returned by a step, compensation or participant handler.
///
/// Handlers mark errors as retryable (the default) or permanent. Permanent errors
/// skip the remaining retry attempts.
///
/// # Example
///
/// ```
/// use sagaflow_core::error::HandlerError;
///
/// let transient = HandlerError::new("connection reset");
/// assert!(transient.is_retryable());
///
/// let permanent = HandlerError::permanent("card declined");
/// assert!(!permanent.is_retryable());
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    retryable: bool,
}

impl HandlerError {
    /// Create a retryable handler error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create an error that must not be retried.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// The error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the engine may retry after this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.retryable
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::permanent(format!("payload (de)serialization failed: {err}"))
    }
}

/// Final failure of a step after its retry budget was spent.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepError {
    /// The last attempt returned an error.
    #[error("Step '{step}' failed after {attempts} attempt(s): {message}")]
    Execution {
        /// Step id
        step: String,
        /// Number of attempts made
        attempts: u32,
        /// Error message from the last attempt
        message: String,
    },

    /// The last attempt did not complete within the step timeout.
    #[error("Step '{step}' timed out after {timeout:?} (attempt {attempts})")]
    Timeout {
        /// Step id
        step: String,
        /// Number of attempts made
        attempts: u32,
        /// The configured timeout
        timeout: Duration,
    },
}

impl StepError {
    /// Id of the failed step.
    #[must_use]
    pub fn step(&self) -> &str {
        match self {
            Self::Execution { step, .. } | Self::Timeout { step, .. } => step,
        }
    }

    /// Number of attempts made before giving up.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Execution { attempts, .. } | Self::Timeout { attempts, .. } => *attempts,
        }
    }
}

/// A compensation action failed.
///
/// Routed to the compensation-error handler; never propagated to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("Compensation of '{target}' failed on attempt {attempt}: {message}")]
pub struct CompensationError {
    /// Step id (Saga) or participant id (TCC cancel) being undone
    pub target: String,
    /// Attempt number that failed (1-based)
    pub attempt: u32,
    /// Error message
    pub message: String,
}

/// TCC phase a participant error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TccPhase {
    /// Tentative reservation
    Try,
    /// Commit of a reservation
    Confirm,
    /// Release of a reservation
    Cancel,
}

impl std::fmt::Display for TccPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Try => write!(f, "try"),
            Self::Confirm => write!(f, "confirm"),
            Self::Cancel => write!(f, "cancel"),
        }
    }
}

/// A Try, Confirm or Cancel call failed after its retries.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TccParticipantError {
    /// The handler returned an error.
    #[error("Participant '{participant}' {phase} failed after {attempts} attempt(s): {message}")]
    Failed {
        /// Participant id
        participant: String,
        /// Phase that failed
        phase: TccPhase,
        /// Attempts made
        attempts: u32,
        /// Error message from the last attempt
        message: String,
    },

    /// The handler did not complete within the participant timeout.
    #[error("Participant '{participant}' {phase} timed out after {timeout:?}")]
    Timeout {
        /// Participant id
        participant: String,
        /// Phase that timed out
        phase: TccPhase,
        /// The configured timeout
        timeout: Duration,
    },

    /// The global Try-phase deadline elapsed.
    #[error("Global try deadline of {timeout:?} exceeded while trying '{participant}'")]
    GlobalTimeout {
        /// Participant in flight when the deadline elapsed
        participant: String,
        /// The configured global timeout
        timeout: Duration,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = DefinitionError::CycleDetected {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Cycle detected in step graph: a -> b -> a");
    }

    #[test]
    fn test_step_error_accessors() {
        let err = StepError::Timeout {
            step: "charge".into(),
            attempts: 3,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(err.step(), "charge");
        assert_eq!(err.attempts(), 3);
    }
}
