//! Saga and TCC definition model.
//!
//! Definitions are immutable descriptions built programmatically with fluent
//! builders. A [`SagaDefinition`] can only be obtained through
//! [`SagaDefinitionBuilder::build`], which runs the [`DagPlanner`] and caches the
//! resulting [`ExecutionPlan`]: an invalid step graph never reaches an engine.

use crate::error::DefinitionError;
use crate::handler::{CompensationHandler, StepHandler, TccParticipant};
use crate::planner::{DagPlanner, ExecutionPlan};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Timeout applied to a step or participant when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of steps of one layer that may run at the same time.
pub const DEFAULT_LAYER_CONCURRENCY: usize = 16;

/// Default consecutive-failure threshold for [`CompensationPolicy::CircuitBreaker`].
pub const DEFAULT_COMPENSATION_FAILURE_THRESHOLD: u32 = 3;

/// Where a step handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Polled on the execution's own task.
    #[default]
    Inline,
    /// Spawned onto its own runtime task, for CPU-heavy handlers.
    Offload,
}

/// One step of a Saga.
///
/// # Example
///
/// ```
/// use sagaflow_core::definition::StepDefinition;
/// use sagaflow_core::handler::step_fn;
/// use sagaflow_core::context::StepOutput;
/// use sagaflow_core::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let step = StepDefinition::new("charge", step_fn(|_| async { Ok(StepOutput::empty()) }))
///     .depends_on("reserve")
///     .timeout(Duration::from_secs(5))
///     .retry(RetryPolicy::new().with_max_attempts(5));
///
/// assert_eq!(step.dependencies(), &["reserve".to_string()]);
/// ```
#[derive(Clone)]
pub struct StepDefinition {
    id: String,
    dependencies: Vec<String>,
    handler: Arc<dyn StepHandler>,
    compensation: Option<Arc<dyn CompensationHandler>>,
    retry: RetryPolicy,
    timeout: Option<Duration>,
    mode: ExecutionMode,
}

impl StepDefinition {
    /// Create a root step (no dependencies) with default retry and timeout.
    #[must_use]
    pub fn new(id: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        Self {
            id: id.into(),
            dependencies: Vec::new(),
            handler,
            compensation: None,
            retry: RetryPolicy::default(),
            timeout: None,
            mode: ExecutionMode::Inline,
        }
    }

    /// Add a dependency. Repeated ids are ignored.
    #[must_use]
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        let step_id = step_id.into();
        if !self.dependencies.contains(&step_id) {
            self.dependencies.push(step_id);
        }
        self
    }

    /// Attach the undo action for this step.
    #[must_use]
    pub fn compensate_with(mut self, handler: Arc<dyn CompensationHandler>) -> Self {
        self.compensation = Some(handler);
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub const fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Set the per-attempt timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the execution mode.
    #[must_use]
    pub const fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Run this step's handler on a spawned task.
    #[must_use]
    pub const fn offload(self) -> Self {
        self.mode(ExecutionMode::Offload)
    }

    /// Step id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Ids this step depends on.
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// The forward handler.
    #[must_use]
    pub fn handler(&self) -> &Arc<dyn StepHandler> {
        &self.handler
    }

    /// The compensation handler, if any.
    #[must_use]
    pub const fn compensation(&self) -> Option<&Arc<dyn CompensationHandler>> {
        self.compensation.as_ref()
    }

    /// Retry policy.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Per-attempt timeout, if one was set explicitly.
    #[must_use]
    pub const fn timeout_duration(&self) -> Option<Duration> {
        self.timeout
    }

    /// Per-attempt timeout, falling back to `default`.
    #[must_use]
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }

    /// Execution mode.
    #[must_use]
    pub const fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .field("has_compensation", &self.compensation.is_some())
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// How compensations are scheduled once a Saga fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationPolicy {
    /// One at a time in strict reverse order; a failure halts the chain.
    #[default]
    StrictSequential,
    /// Layers in reverse order, members of one layer concurrently.
    GroupedParallel,
    /// Sequential, each action retried with the step's backoff policy.
    RetryWithBackoff,
    /// Sequential; after `failure_threshold` consecutive failures the rest is skipped.
    CircuitBreaker {
        /// Consecutive failures that open the breaker
        failure_threshold: u32,
    },
    /// Everything dispatched at once; failures do not block others.
    BestEffortParallel,
}

impl CompensationPolicy {
    /// Canonical configuration name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StrictSequential => "STRICT_SEQUENTIAL",
            Self::GroupedParallel => "GROUPED_PARALLEL",
            Self::RetryWithBackoff => "RETRY_WITH_BACKOFF",
            Self::CircuitBreaker { .. } => "CIRCUIT_BREAKER",
            Self::BestEffortParallel => "BEST_EFFORT_PARALLEL",
        }
    }
}

impl fmt::Display for CompensationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error type for [`CompensationPolicy`] parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown compensation policy: {0}")]
pub struct ParsePolicyError(String);

impl FromStr for CompensationPolicy {
    type Err = ParsePolicyError;

    /// Parse a policy name, case-insensitively, with `-` or `_` separators.
    ///
    /// `CIRCUIT_BREAKER` accepts an optional threshold suffix: `CIRCUIT_BREAKER:5`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        let (name, argument) = match normalized.split_once(':') {
            Some((name, argument)) => (name.to_string(), Some(argument.to_string())),
            None => (normalized, None),
        };

        match (name.as_str(), argument) {
            ("STRICT_SEQUENTIAL", None) => Ok(Self::StrictSequential),
            ("GROUPED_PARALLEL", None) => Ok(Self::GroupedParallel),
            ("RETRY_WITH_BACKOFF", None) => Ok(Self::RetryWithBackoff),
            ("BEST_EFFORT_PARALLEL", None) => Ok(Self::BestEffortParallel),
            ("CIRCUIT_BREAKER", None) => Ok(Self::CircuitBreaker {
                failure_threshold: DEFAULT_COMPENSATION_FAILURE_THRESHOLD,
            }),
            ("CIRCUIT_BREAKER", Some(threshold)) => threshold
                .parse::<u32>()
                .ok()
                .filter(|t| *t > 0)
                .map(|failure_threshold| Self::CircuitBreaker { failure_threshold })
                .ok_or_else(|| ParsePolicyError(s.to_string())),
            _ => Err(ParsePolicyError(s.to_string())),
        }
    }
}

/// Immutable description of a Saga.
#[derive(Clone)]
pub struct SagaDefinition {
    name: String,
    steps: Vec<StepDefinition>,
    compensation_policy: CompensationPolicy,
    layer_concurrency: usize,
    plan: ExecutionPlan,
}

impl SagaDefinition {
    /// Start building a Saga.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> SagaDefinitionBuilder {
        SagaDefinitionBuilder {
            name: name.into(),
            steps: Vec::new(),
            compensation_policy: CompensationPolicy::default(),
            layer_concurrency: DEFAULT_LAYER_CONCURRENCY,
        }
    }

    /// Definition name, also used as the backpressure key.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Steps in declaration order.
    #[must_use]
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    /// Look up a step by id.
    #[must_use]
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|step| step.id() == id)
    }

    /// The cached topological plan.
    #[must_use]
    pub const fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Selected compensation policy.
    #[must_use]
    pub const fn compensation_policy(&self) -> CompensationPolicy {
        self.compensation_policy
    }

    /// Maximum number of concurrently running steps within one layer.
    #[must_use]
    pub const fn layer_concurrency(&self) -> usize {
        self.layer_concurrency
    }
}

impl fmt::Debug for SagaDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaDefinition")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("compensation_policy", &self.compensation_policy)
            .field("layer_concurrency", &self.layer_concurrency)
            .field("layers", &self.plan.layers())
            .finish()
    }
}

/// Builder for [`SagaDefinition`].
#[derive(Debug)]
pub struct SagaDefinitionBuilder {
    name: String,
    steps: Vec<StepDefinition>,
    compensation_policy: CompensationPolicy,
    layer_concurrency: usize,
}

impl SagaDefinitionBuilder {
    /// Add a step.
    #[must_use]
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Select the compensation policy.
    #[must_use]
    pub const fn compensation_policy(mut self, policy: CompensationPolicy) -> Self {
        self.compensation_policy = policy;
        self
    }

    /// Set the per-layer concurrency limit.
    #[must_use]
    pub const fn layer_concurrency(mut self, limit: usize) -> Self {
        self.layer_concurrency = limit;
        self
    }

    /// Validate the step graph and build the definition.
    ///
    /// # Errors
    ///
    /// Returns [`DefinitionError`] for a zero concurrency limit or any planner
    /// error (empty, duplicate id, dangling dependency, cycle).
    pub fn build(self) -> Result<SagaDefinition, DefinitionError> {
        if self.layer_concurrency == 0 {
            return Err(DefinitionError::InvalidConcurrency {
                definition: self.name,
            });
        }

        let plan = DagPlanner::plan(&self.name, &self.steps)?;

        Ok(SagaDefinition {
            name: self.name,
            steps: self.steps,
            compensation_policy: self.compensation_policy,
            layer_concurrency: self.layer_concurrency,
            plan,
        })
    }
}

/// One participant of a TCC transaction.
#[derive(Clone)]
pub struct ParticipantDefinition {
    id: String,
    participant: Arc<dyn TccParticipant>,
    optional: bool,
    timeout: Option<Duration>,
    retry: RetryPolicy,
}

impl ParticipantDefinition {
    /// Create a required participant with default retry and timeout.
    #[must_use]
    pub fn new(id: impl Into<String>, participant: Arc<dyn TccParticipant>) -> Self {
        Self {
            id: id.into(),
            participant,
            optional: false,
            timeout: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Mark the participant optional: a failed Try does not abort the transaction.
    #[must_use]
    pub const fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Set the per-call timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the retry policy used for every phase.
    #[must_use]
    pub const fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Participant id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The participant implementation.
    #[must_use]
    pub fn participant(&self) -> &Arc<dyn TccParticipant> {
        &self.participant
    }

    /// Whether a failed Try is tolerated.
    #[must_use]
    pub const fn is_optional(&self) -> bool {
        self.optional
    }

    /// Per-call timeout, if one was set explicitly.
    #[must_use]
    pub const fn timeout_duration(&self) -> Option<Duration> {
        self.timeout
    }

    /// Per-call timeout, falling back to `default`.
    #[must_use]
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }

    /// Retry policy.
    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }
}

impl fmt::Debug for ParticipantDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticipantDefinition")
            .field("id", &self.id)
            .field("optional", &self.optional)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Immutable description of a TCC transaction.
#[derive(Clone, Debug)]
pub struct TccDefinition {
    name: String,
    participants: Vec<ParticipantDefinition>,
    global_timeout: Option<Duration>,
}

impl TccDefinition {
    /// Start building a TCC transaction.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> TccDefinitionBuilder {
        TccDefinitionBuilder {
            name: name.into(),
            participants: Vec::new(),
            global_timeout: None,
        }
    }

    /// Definition name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Participants in declared order.
    #[must_use]
    pub fn participants(&self) -> &[ParticipantDefinition] {
        &self.participants
    }

    /// Look up a participant by id.
    #[must_use]
    pub fn participant(&self, id: &str) -> Option<&ParticipantDefinition> {
        self.participants.iter().find(|p| p.id() == id)
    }

    /// Upper bound for the whole Try phase.
    #[must_use]
    pub const fn global_timeout(&self) -> Option<Duration> {
        self.global_timeout
    }
}

/// Builder for [`TccDefinition`].
#[derive(Debug)]
pub struct TccDefinitionBuilder {
    name: String,
    participants: Vec<ParticipantDefinition>,
    global_timeout: Option<Duration>,
}

impl TccDefinitionBuilder {
    /// Append a participant (declared order matters).
    #[must_use]
    pub fn participant(mut self, participant: ParticipantDefinition) -> Self {
        self.participants.push(participant);
        self
    }

    /// Bound the duration of the Try phase.
    #[must_use]
    pub const fn global_timeout(mut self, timeout: Duration) -> Self {
        self.global_timeout = Some(timeout);
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Returns [`DefinitionError::Empty`] without participants and
    /// [`DefinitionError::DuplicateId`] when two participants share an id.
    pub fn build(self) -> Result<TccDefinition, DefinitionError> {
        if self.participants.is_empty() {
            return Err(DefinitionError::Empty {
                definition: self.name,
            });
        }

        let mut seen = HashSet::with_capacity(self.participants.len());
        for participant in &self.participants {
            if !seen.insert(participant.id()) {
                return Err(DefinitionError::DuplicateId {
                    definition: self.name.clone(),
                    id: participant.id().to_string(),
                });
            }
        }

        Ok(TccDefinition {
            name: self.name,
            participants: self.participants,
            global_timeout: self.global_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StepOutput;
    use crate::handler::step_fn;

    fn noop(id: &str) -> StepDefinition {
        StepDefinition::new(id, step_fn(|_| async { Ok(StepOutput::empty()) }))
    }

    #[test]
    fn test_build_caches_plan() {
        let saga = SagaDefinition::builder("order")
            .step(noop("a"))
            .step(noop("b").depends_on("a"))
            .build()
            .unwrap();

        assert_eq!(saga.plan().layer_of("b"), Some(1));
        assert_eq!(saga.compensation_policy(), CompensationPolicy::StrictSequential);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = SagaDefinition::builder("order")
            .step(noop("a"))
            .layer_concurrency(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, DefinitionError::InvalidConcurrency { .. }));
    }

    #[test]
    fn test_duplicate_dependency_ignored() {
        let step = noop("b").depends_on("a").depends_on("a");
        assert_eq!(step.dependencies().len(), 1);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            "strict-sequential".parse::<CompensationPolicy>().unwrap(),
            CompensationPolicy::StrictSequential
        );
        assert_eq!(
            "CIRCUIT_BREAKER:2".parse::<CompensationPolicy>().unwrap(),
            CompensationPolicy::CircuitBreaker { failure_threshold: 2 }
        );
        assert_eq!(
            "circuit_breaker".parse::<CompensationPolicy>().unwrap(),
            CompensationPolicy::CircuitBreaker {
                failure_threshold: DEFAULT_COMPENSATION_FAILURE_THRESHOLD
            }
        );
        assert!("CIRCUIT_BREAKER:0".parse::<CompensationPolicy>().is_err());
        assert!("YOLO".parse::<CompensationPolicy>().is_err());
    }
}
