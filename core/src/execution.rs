//! Execution records.
//!
//! A [`SagaExecution`] or [`TccExecution`] is the mutable record of one run. The
//! engine that owns the execution id mutates it; every transition is written through
//! the persistence port as an [`ExecutionRecord`]. The `revision` counter is bumped on
//! each write and lets stores reject out-of-order writers.

use crate::definition::{SagaDefinition, TccDefinition};
use crate::id::ExecutionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Lifecycle of a Saga execution.
///
/// ```text
/// Pending → Running → Completed
///                  ↘ Compensating → Compensated
///                                 ↘ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// Created, no step started yet
    Pending,
    /// Layers are being executed
    Running,
    /// Every step succeeded
    Completed,
    /// A step failed; undo actions are running
    Compensating,
    /// Every eligible compensation succeeded
    Compensated,
    /// Compensation was incomplete, or the state could not be persisted
    Failed,
}

impl SagaStatus {
    /// Terminal statuses are never re-driven by recovery.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Compensated | Self::Failed)
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Compensating => "COMPENSATING",
            Self::Compensated => "COMPENSATED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Lifecycle of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Not started
    Pending,
    /// An attempt is in flight
    Running,
    /// The forward action committed
    Succeeded,
    /// Retries exhausted
    Failed,
    /// The undo action is in flight
    Compensating,
    /// The undo action succeeded
    Compensated,
    /// Compensation was intentionally not attempted
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Compensating => "COMPENSATING",
            Self::Compensated => "COMPENSATED",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(name)
    }
}

/// Per-step record inside a [`SagaExecution`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    /// Step id
    pub step_id: String,
    /// Plan layer of the step
    pub layer: usize,
    /// Whether the step declares a compensation action
    pub compensable: bool,
    /// Current status
    pub status: StepStatus,
    /// Forward attempts made
    pub attempts: u32,
    /// Compensation attempts made
    pub compensation_attempts: u32,
    /// Last forward error
    pub last_error: Option<String>,
    /// Last compensation error, kept when the undo action could not complete
    pub compensation_error: Option<String>,
    /// Output produced on success
    pub output: Option<Value>,
    /// When the first attempt started
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached its latest terminal status
    pub ended_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    fn pending(step_id: &str, layer: usize, compensable: bool) -> Self {
        Self {
            step_id: step_id.to_string(),
            layer,
            compensable,
            status: StepStatus::Pending,
            attempts: 0,
            compensation_attempts: 0,
            last_error: None,
            compensation_error: None,
            output: None,
            started_at: None,
            ended_at: None,
        }
    }
}

/// Which steps or participants ended where.
///
/// Every terminal execution can produce a manifest, so callers never have to
/// interpret raw statuses to learn what was left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionManifest {
    /// Forward actions that committed (and were not undone)
    pub succeeded: Vec<String>,
    /// Forward actions or phases that failed
    pub failed: Vec<String>,
    /// Undo actions that completed
    pub compensated: Vec<String>,
    /// Undo actions intentionally not attempted
    pub skipped: Vec<String>,
    /// Committed work that still needs undoing
    pub uncompensated: Vec<String>,
    /// Never started
    pub not_started: Vec<String>,
}

impl ExecutionManifest {
    /// True when no committed work is left uncompensated.
    ///
    /// Undo actions a policy deliberately skipped do not count against it.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.uncompensated.is_empty()
    }
}

/// Record of one Saga run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaExecution {
    /// Execution id
    pub id: ExecutionId,
    /// Name of the definition being executed
    pub definition_name: String,
    /// Current status
    pub status: SagaStatus,
    /// Steps in declaration order
    pub steps: Vec<StepExecution>,
    /// Transaction input
    pub input: Value,
    /// Header values supplied at submission
    pub headers: HashMap<String, String>,
    /// Cross-step variable bag
    pub variables: HashMap<String, Value>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// When the first layer started
    pub started_at: Option<DateTime<Utc>>,
    /// When a terminal status was reached
    pub ended_at: Option<DateTime<Utc>>,
    /// Time of the last persisted transition
    pub updated_at: DateTime<Utc>,
    /// Write counter for optimistic concurrency
    pub revision: u64,
    /// Cause of failure, if any
    pub error: Option<String>,
    /// A persistence write failed; the durable state may lag behind this record
    pub state_unknown: bool,
}

impl SagaExecution {
    /// Create a pending execution for a definition.
    #[must_use]
    pub fn new(
        definition: &SagaDefinition,
        input: Value,
        headers: HashMap<String, String>,
        now: DateTime<Utc>,
    ) -> Self {
        let plan = definition.plan();
        let steps = definition
            .steps()
            .iter()
            .map(|step| {
                StepExecution::pending(
                    step.id(),
                    plan.layer_of(step.id()).unwrap_or_default(),
                    step.compensation().is_some(),
                )
            })
            .collect();

        Self {
            id: ExecutionId::new(),
            definition_name: definition.name().to_string(),
            status: SagaStatus::Pending,
            steps,
            input,
            headers,
            variables: HashMap::new(),
            created_at: now,
            started_at: None,
            ended_at: None,
            updated_at: now,
            revision: 0,
            error: None,
            state_unknown: false,
        }
    }

    /// Whether the execution reached a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Look up a step record.
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Look up a step record mutably.
    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepExecution> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Summarize where every step ended.
    #[must_use]
    pub fn manifest(&self) -> ExecutionManifest {
        let unwinding = matches!(
            self.status,
            SagaStatus::Compensating | SagaStatus::Compensated | SagaStatus::Failed
        );
        let mut manifest = ExecutionManifest::default();

        for step in &self.steps {
            let id = step.step_id.clone();
            match step.status {
                StepStatus::Succeeded | StepStatus::Compensating
                    if unwinding && step.compensable =>
                {
                    manifest.uncompensated.push(id);
                }
                StepStatus::Succeeded | StepStatus::Compensating => manifest.succeeded.push(id),
                StepStatus::Failed => manifest.failed.push(id),
                StepStatus::Compensated => manifest.compensated.push(id),
                StepStatus::Skipped => manifest.skipped.push(id),
                StepStatus::Pending | StepStatus::Running => manifest.not_started.push(id),
            }
        }

        manifest
    }
}

/// Lifecycle of a TCC execution.
///
/// ```text
/// Trying → Confirming → Confirmed
///        ↘ Cancelling → Cancelled
///                     ↘ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TccStatus {
    /// Try phase in progress
    Trying,
    /// Confirm phase in progress
    Confirming,
    /// Every required Try succeeded and Confirm ran
    Confirmed,
    /// Cancel phase in progress
    Cancelling,
    /// Every tried participant was cancelled
    Cancelled,
    /// Cancellation was incomplete, or the state could not be persisted
    Failed,
}

impl TccStatus {
    /// Terminal statuses are never re-driven by recovery.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for TccStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trying => "TRYING",
            Self::Confirming => "CONFIRMING",
            Self::Confirmed => "CONFIRMED",
            Self::Cancelling => "CANCELLING",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Outcome of one TCC phase for one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseStatus {
    /// Not invoked
    #[default]
    NotStarted,
    /// Call in flight
    Running,
    /// Call succeeded
    Succeeded,
    /// Call failed after retries
    Failed,
    /// Intentionally not invoked
    Skipped,
}

/// Per-participant record inside a [`TccExecution`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantExecution {
    /// Participant id
    pub participant_id: String,
    /// Whether a failed Try is tolerated
    pub optional: bool,
    /// Try phase outcome
    pub try_status: PhaseStatus,
    /// Confirm phase outcome
    pub confirm_status: PhaseStatus,
    /// Cancel phase outcome
    pub cancel_status: PhaseStatus,
    /// Total calls made across phases
    pub attempts: u32,
    /// Last error from any phase
    pub last_error: Option<String>,
    /// Value returned by Try
    pub reservation: Option<Value>,
}

/// Record of one TCC run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TccExecution {
    /// Execution id
    pub id: ExecutionId,
    /// Name of the definition being executed
    pub definition_name: String,
    /// Current status
    pub status: TccStatus,
    /// Participants in declared order
    pub participants: Vec<ParticipantExecution>,
    /// Transaction input
    pub input: Value,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// When a terminal status was reached
    pub ended_at: Option<DateTime<Utc>>,
    /// Time of the last persisted transition
    pub updated_at: DateTime<Utc>,
    /// Write counter for optimistic concurrency
    pub revision: u64,
    /// Cause of failure, if any
    pub error: Option<String>,
    /// A persistence write failed; the durable state may lag behind this record
    pub state_unknown: bool,
}

impl TccExecution {
    /// Create an execution in the Try phase.
    #[must_use]
    pub fn new(definition: &TccDefinition, input: Value, now: DateTime<Utc>) -> Self {
        let participants = definition
            .participants()
            .iter()
            .map(|p| ParticipantExecution {
                participant_id: p.id().to_string(),
                optional: p.is_optional(),
                try_status: PhaseStatus::NotStarted,
                confirm_status: PhaseStatus::NotStarted,
                cancel_status: PhaseStatus::NotStarted,
                attempts: 0,
                last_error: None,
                reservation: None,
            })
            .collect();

        Self {
            id: ExecutionId::new(),
            definition_name: definition.name().to_string(),
            status: TccStatus::Trying,
            participants,
            input,
            created_at: now,
            ended_at: None,
            updated_at: now,
            revision: 0,
            error: None,
            state_unknown: false,
        }
    }

    /// Whether the execution reached a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Look up a participant record.
    #[must_use]
    pub fn participant(&self, participant_id: &str) -> Option<&ParticipantExecution> {
        self.participants
            .iter()
            .find(|p| p.participant_id == participant_id)
    }

    /// Look up a participant record mutably.
    pub fn participant_mut(&mut self, participant_id: &str) -> Option<&mut ParticipantExecution> {
        self.participants
            .iter_mut()
            .find(|p| p.participant_id == participant_id)
    }

    /// Summarize where every participant ended.
    #[must_use]
    pub fn manifest(&self) -> ExecutionManifest {
        let unwinding = matches!(
            self.status,
            TccStatus::Cancelling | TccStatus::Cancelled | TccStatus::Failed
        );
        let mut manifest = ExecutionManifest::default();

        for p in &self.participants {
            let id = p.participant_id.clone();
            if p.try_status == PhaseStatus::NotStarted {
                manifest.not_started.push(id);
                continue;
            }
            if p.try_status == PhaseStatus::Failed || p.confirm_status == PhaseStatus::Failed {
                manifest.failed.push(id.clone());
            }
            match p.cancel_status {
                PhaseStatus::Succeeded => manifest.compensated.push(id),
                PhaseStatus::Skipped => manifest.skipped.push(id),
                _ if unwinding && p.try_status == PhaseStatus::Succeeded => {
                    manifest.uncompensated.push(id);
                }
                _ if p.confirm_status == PhaseStatus::Succeeded => manifest.succeeded.push(id),
                _ => {}
            }
        }

        manifest
    }
}

/// What the persistence port stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionRecord {
    /// A Saga execution
    Saga(SagaExecution),
    /// A TCC execution
    Tcc(TccExecution),
}

impl ExecutionRecord {
    /// Execution id.
    #[must_use]
    pub const fn id(&self) -> ExecutionId {
        match self {
            Self::Saga(e) => e.id,
            Self::Tcc(e) => e.id,
        }
    }

    /// Definition name.
    #[must_use]
    pub fn definition_name(&self) -> &str {
        match self {
            Self::Saga(e) => &e.definition_name,
            Self::Tcc(e) => &e.definition_name,
        }
    }

    /// Write counter.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        match self {
            Self::Saga(e) => e.revision,
            Self::Tcc(e) => e.revision,
        }
    }

    /// Time of the last transition.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        match self {
            Self::Saga(e) => e.updated_at,
            Self::Tcc(e) => e.updated_at,
        }
    }

    /// Whether the execution reached a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        match self {
            Self::Saga(e) => e.is_terminal(),
            Self::Tcc(e) => e.is_terminal(),
        }
    }

    /// Status name, for logging.
    #[must_use]
    pub fn status_name(&self) -> String {
        match self {
            Self::Saga(e) => e.status.to_string(),
            Self::Tcc(e) => e.status.to_string(),
        }
    }
}

impl From<SagaExecution> for ExecutionRecord {
    fn from(execution: SagaExecution) -> Self {
        Self::Saga(execution)
    }
}

impl From<TccExecution> for ExecutionRecord {
    fn from(execution: TccExecution) -> Self {
        Self::Tcc(execution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StepOutput;
    use crate::definition::StepDefinition;
    use crate::handler::{compensation_fn, step_fn};
    use serde_json::json;

    fn definition() -> SagaDefinition {
        SagaDefinition::builder("order")
            .step(
                StepDefinition::new("a", step_fn(|_| async { Ok(StepOutput::empty()) }))
                    .compensate_with(compensation_fn(|_| async { Ok(()) })),
            )
            .step(
                StepDefinition::new("b", step_fn(|_| async { Ok(StepOutput::empty()) }))
                    .depends_on("a"),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_new_execution_is_pending() {
        let exec = SagaExecution::new(&definition(), json!({}), HashMap::new(), Utc::now());
        assert_eq!(exec.status, SagaStatus::Pending);
        assert_eq!(exec.steps.len(), 2);
        assert_eq!(exec.step("b").map(|s| s.layer), Some(1));
        assert!(exec.step("a").is_some_and(|s| s.compensable));
    }

    #[test]
    fn test_manifest_reports_uncompensated_work() {
        let mut exec = SagaExecution::new(&definition(), json!({}), HashMap::new(), Utc::now());
        exec.status = SagaStatus::Failed;
        if let Some(a) = exec.step_mut("a") {
            a.status = StepStatus::Succeeded;
        }
        if let Some(b) = exec.step_mut("b") {
            b.status = StepStatus::Failed;
        }

        let manifest = exec.manifest();
        assert_eq!(manifest.uncompensated, vec!["a".to_string()]);
        assert_eq!(manifest.failed, vec!["b".to_string()]);
        assert!(!manifest.is_clean());
    }

    #[test]
    fn test_skipped_undo_keeps_manifest_clean() {
        let mut exec = SagaExecution::new(&definition(), json!({}), HashMap::new(), Utc::now());
        exec.status = SagaStatus::Compensated;
        if let Some(a) = exec.step_mut("a") {
            a.status = StepStatus::Skipped;
        }
        if let Some(b) = exec.step_mut("b") {
            b.status = StepStatus::Failed;
        }

        let manifest = exec.manifest();
        assert_eq!(manifest.skipped, vec!["a".to_string()]);
        assert!(manifest.is_clean());
    }

    #[test]
    fn test_record_serializes_with_kind_tag() {
        let exec = SagaExecution::new(&definition(), json!({"x": 1}), HashMap::new(), Utc::now());
        let record = ExecutionRecord::from(exec.clone());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "saga");

        let back: ExecutionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, ExecutionRecord::Saga(exec));
    }
}
