//! Lifecycle events and the events port.
//!
//! Engines emit a [`LifecycleEvent`] at every significant transition. Delivery is
//! best effort: a failing [`EventSink`] is logged by the engine and never aborts
//! an execution.

use crate::BoxFuture;
use crate::id::ExecutionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Something that happened to an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LifecycleEvent {
    /// A Saga execution began
    SagaStarted {
        /// Execution id
        execution_id: ExecutionId,
        /// Definition name
        definition: String,
    },
    /// A step succeeded
    StepCompleted {
        /// Execution id
        execution_id: ExecutionId,
        /// Step id
        step_id: String,
        /// Attempts it took
        attempts: u32,
    },
    /// A step failed after its retries
    StepFailed {
        /// Execution id
        execution_id: ExecutionId,
        /// Step id
        step_id: String,
        /// Failure description
        error: String,
    },
    /// A step's undo action succeeded
    StepCompensated {
        /// Execution id
        execution_id: ExecutionId,
        /// Step id
        step_id: String,
    },
    /// Every step succeeded
    SagaCompleted {
        /// Execution id
        execution_id: ExecutionId,
        /// Definition name
        definition: String,
    },
    /// Every eligible step was compensated
    SagaCompensated {
        /// Execution id
        execution_id: ExecutionId,
        /// Definition name
        definition: String,
    },
    /// The Saga ended with work left uncompensated, or its state is unknown
    SagaFailed {
        /// Execution id
        execution_id: ExecutionId,
        /// Definition name
        definition: String,
        /// Failure description
        error: String,
    },
    /// A TCC execution began
    TccStarted {
        /// Execution id
        execution_id: ExecutionId,
        /// Definition name
        definition: String,
    },
    /// A participant's Try phase ended
    TccParticipantTried {
        /// Execution id
        execution_id: ExecutionId,
        /// Participant id
        participant_id: String,
        /// Whether the Try succeeded
        success: bool,
    },
    /// The Confirm phase ran
    TccConfirmed {
        /// Execution id
        execution_id: ExecutionId,
        /// Definition name
        definition: String,
    },
    /// Every tried participant was cancelled
    TccCancelled {
        /// Execution id
        execution_id: ExecutionId,
        /// Definition name
        definition: String,
    },
    /// Cancellation was incomplete, or the state is unknown
    TccFailed {
        /// Execution id
        execution_id: ExecutionId,
        /// Definition name
        definition: String,
        /// Failure description
        error: String,
    },
}

impl LifecycleEvent {
    /// Stable event name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SagaStarted { .. } => "SagaStarted",
            Self::StepCompleted { .. } => "StepCompleted",
            Self::StepFailed { .. } => "StepFailed",
            Self::StepCompensated { .. } => "StepCompensated",
            Self::SagaCompleted { .. } => "SagaCompleted",
            Self::SagaCompensated { .. } => "SagaCompensated",
            Self::SagaFailed { .. } => "SagaFailed",
            Self::TccStarted { .. } => "TccStarted",
            Self::TccParticipantTried { .. } => "TccParticipantTried",
            Self::TccConfirmed { .. } => "TccConfirmed",
            Self::TccCancelled { .. } => "TccCancelled",
            Self::TccFailed { .. } => "TccFailed",
        }
    }

    /// Execution the event belongs to.
    #[must_use]
    pub const fn execution_id(&self) -> ExecutionId {
        match self {
            Self::SagaStarted { execution_id, .. }
            | Self::StepCompleted { execution_id, .. }
            | Self::StepFailed { execution_id, .. }
            | Self::StepCompensated { execution_id, .. }
            | Self::SagaCompleted { execution_id, .. }
            | Self::SagaCompensated { execution_id, .. }
            | Self::SagaFailed { execution_id, .. }
            | Self::TccStarted { execution_id, .. }
            | Self::TccParticipantTried { execution_id, .. }
            | Self::TccConfirmed { execution_id, .. }
            | Self::TccCancelled { execution_id, .. }
            | Self::TccFailed { execution_id, .. } => *execution_id,
        }
    }

    /// Whether the event marks the end of an execution.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::SagaCompleted { .. }
                | Self::SagaCompensated { .. }
                | Self::SagaFailed { .. }
                | Self::TccConfirmed { .. }
                | Self::TccCancelled { .. }
                | Self::TccFailed { .. }
        )
    }
}

/// Errors reported by an event sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventSinkError {
    /// The sink could not deliver the event.
    #[error("Event delivery failed: {0}")]
    Delivery(String),

    /// The sink is closed.
    #[error("Event sink closed")]
    Closed,
}

/// Events port.
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    ///
    /// # Errors
    ///
    /// Returns [`EventSinkError`] if delivery failed. Engines log the error and go on.
    fn emit(&self, event: LifecycleEvent) -> BoxFuture<'_, Result<(), EventSinkError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        let id = ExecutionId::new();
        let started = LifecycleEvent::SagaStarted {
            execution_id: id,
            definition: "order".into(),
        };
        let done = LifecycleEvent::SagaCompleted {
            execution_id: id,
            definition: "order".into(),
        };
        assert!(!started.is_terminal());
        assert!(done.is_terminal());
        assert_eq!(done.name(), "SagaCompleted");
        assert_eq!(done.execution_id(), id);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = LifecycleEvent::StepCompensated {
            execution_id: ExecutionId::new(),
            step_id: "reserve".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "StepCompensated");
        assert_eq!(json["step_id"], "reserve");
    }
}
