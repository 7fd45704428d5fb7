//! Execution context passed to handlers.
//!
//! Handlers never touch the execution record directly. A step handler receives a
//! read-only [`StepContext`] snapshot taken at invocation time and returns a
//! [`StepOutput`]; the engine applies that output to the execution. This keeps
//! writes limited to the step's own output and declared variables.

use crate::error::HandlerError;
use crate::id::ExecutionId;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Read-only view of an execution handed to a step handler.
///
/// Contains:
/// - the original transaction input
/// - outputs of the step's direct dependencies
/// - header values supplied at submission
/// - execution variables declared by earlier steps
#[derive(Debug, Clone)]
pub struct StepContext {
    execution_id: ExecutionId,
    step_id: String,
    attempt: u32,
    input: Arc<Value>,
    headers: Arc<HashMap<String, String>>,
    variables: HashMap<String, Value>,
    dependency_outputs: HashMap<String, Value>,
}

impl StepContext {
    /// Build a context snapshot.
    #[must_use]
    pub const fn new(
        execution_id: ExecutionId,
        step_id: String,
        attempt: u32,
        input: Arc<Value>,
        headers: Arc<HashMap<String, String>>,
        variables: HashMap<String, Value>,
        dependency_outputs: HashMap<String, Value>,
    ) -> Self {
        Self {
            execution_id,
            step_id,
            attempt,
            input,
            headers,
            variables,
            dependency_outputs,
        }
    }

    /// Id of the running execution.
    #[must_use]
    pub const fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Id of the step being invoked.
    #[must_use]
    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// Current attempt number (1-based).
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The original transaction input.
    #[must_use]
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Deserialize the transaction input.
    ///
    /// # Errors
    ///
    /// Returns a permanent [`HandlerError`] if the input does not match `T`.
    pub fn input_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(T::deserialize(self.input.as_ref())?)
    }

    /// A header value supplied at submission.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// An execution variable declared by an earlier step.
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Output of a direct dependency.
    ///
    /// Returns `None` for steps that are not direct dependencies or that produced
    /// no output.
    #[must_use]
    pub fn output_of(&self, step_id: &str) -> Option<&Value> {
        self.dependency_outputs.get(step_id)
    }

    /// Deserialize the output of a direct dependency.
    ///
    /// # Errors
    ///
    /// Returns a permanent [`HandlerError`] if the output is missing or does not
    /// match `T`.
    pub fn output_as<T: DeserializeOwned>(&self, step_id: &str) -> Result<T, HandlerError> {
        let value = self.output_of(step_id).ok_or_else(|| {
            HandlerError::permanent(format!("no output available from step '{step_id}'"))
        })?;
        Ok(T::deserialize(value)?)
    }
}

/// What a successful step hands back to the engine.
///
/// # Example
///
/// ```
/// use sagaflow_core::context::StepOutput;
/// use serde_json::json;
///
/// let out = StepOutput::with_output(json!({"reservation": "r-1"}))
///     .variable("customer_tier", json!("gold"));
/// assert!(out.output().is_some());
/// assert_eq!(out.variables().len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    output: Option<Value>,
    variables: HashMap<String, Value>,
}

impl StepOutput {
    /// No output and no variables.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// A named output, visible to direct dependents.
    #[must_use]
    pub fn with_output(output: Value) -> Self {
        Self {
            output: Some(output),
            variables: HashMap::new(),
        }
    }

    /// Serialize a value as the step output.
    ///
    /// # Errors
    ///
    /// Returns a permanent [`HandlerError`] if the value cannot be serialized.
    pub fn serialized<T: Serialize>(output: &T) -> Result<Self, HandlerError> {
        Ok(Self::with_output(serde_json::to_value(output)?))
    }

    /// Declare an execution variable, visible to later steps.
    #[must_use]
    pub fn variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    /// The step output, if any.
    #[must_use]
    pub const fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }

    /// Declared variables.
    #[must_use]
    pub const fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    /// Split into output and variables.
    #[must_use]
    pub fn into_parts(self) -> (Option<Value>, HashMap<String, Value>) {
        (self.output, self.variables)
    }
}

/// Context handed to a compensation handler.
///
/// Carries what the step produced so the undo action can reverse it.
#[derive(Debug, Clone)]
pub struct CompensationContext {
    /// Id of the execution being compensated
    pub execution_id: ExecutionId,
    /// Step being undone
    pub step_id: String,
    /// Compensation attempt number (1-based)
    pub attempt: u32,
    /// The original transaction input
    pub input: Arc<Value>,
    /// Output the step produced when it succeeded
    pub output: Option<Value>,
    /// Execution variables at the time compensation started
    pub variables: HashMap<String, Value>,
}

/// Context handed to a TCC participant for every phase.
#[derive(Debug, Clone)]
pub struct ParticipantContext {
    /// Id of the TCC execution
    pub execution_id: ExecutionId,
    /// Participant being invoked
    pub participant_id: String,
    /// Attempt number within the current phase (1-based)
    pub attempt: u32,
    /// The original transaction input
    pub input: Arc<Value>,
    /// What the participant's Try returned (absent during Try)
    pub reservation: Option<Value>,
}
