//! Scripted handlers.
//!
//! Every handler appends `"<kind>:<name>"` to a shared [`CallJournal`] when it is
//! invoked, so tests can assert on the exact order of calls across steps,
//! compensations and participants.

use sagaflow_core::BoxFuture;
use sagaflow_core::context::{CompensationContext, ParticipantContext, StepContext, StepOutput};
use sagaflow_core::error::HandlerError;
use sagaflow_core::handler::{CompensationHandler, StepHandler, TccParticipant};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Ordered log of handler invocations, shared between handlers.
#[derive(Debug, Clone, Default)]
pub struct CallJournal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallJournal {
    /// Create an empty journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn record(&self, entry: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.into());
    }

    /// Every entry, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Entries starting with `prefix` (e.g. `"cancel:"`), oldest first.
    #[must_use]
    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }

    /// How many times `entry` was recorded.
    #[must_use]
    pub fn count(&self, entry: &str) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| *e == entry)
            .count()
    }
}

/// Step handler that fails a scripted number of times, then succeeds.
#[derive(Debug)]
pub struct ScriptedStep {
    name: String,
    journal: CallJournal,
    failures: u32,
    permanent: bool,
    output: Option<Value>,
    delay: Duration,
    calls: AtomicU32,
    attempt_times: Mutex<Vec<Instant>>,
}

impl ScriptedStep {
    /// A step that always succeeds with no output.
    #[must_use]
    pub fn new(name: impl Into<String>, journal: &CallJournal) -> Self {
        Self {
            name: name.into(),
            journal: journal.clone(),
            failures: 0,
            permanent: false,
            output: None,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            attempt_times: Mutex::new(Vec::new()),
        }
    }

    /// Fail the first `n` invocations with a retryable error.
    #[must_use]
    pub const fn failing_first(mut self, n: u32) -> Self {
        self.failures = n;
        self
    }

    /// Fail every invocation.
    #[must_use]
    pub const fn always_failing(self) -> Self {
        self.failing_first(u32::MAX)
    }

    /// Make the scripted failures permanent (not retried).
    #[must_use]
    pub const fn permanent(mut self) -> Self {
        self.permanent = true;
        self
    }

    /// Output returned on success.
    #[must_use]
    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    /// Sleep this long inside every invocation.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Invocations so far.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Start instant of every invocation, on the tokio clock.
    #[must_use]
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempt_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Gaps between consecutive invocations.
    #[must_use]
    pub fn gaps(&self) -> Vec<Duration> {
        self.attempt_times()
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .collect()
    }
}

impl StepHandler for ScriptedStep {
    fn execute<'a>(&'a self, ctx: &'a StepContext) -> BoxFuture<'a, Result<StepOutput, HandlerError>> {
        Box::pin(async move {
            self.journal.record(format!("step:{}", self.name));
            self.attempt_times
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Instant::now());
            let call = self.calls.fetch_add(1, Ordering::SeqCst);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            if call < self.failures {
                let message = format!("{} failed on attempt {}", self.name, ctx.attempt());
                return Err(if self.permanent {
                    HandlerError::permanent(message)
                } else {
                    HandlerError::new(message)
                });
            }

            Ok(self
                .output
                .clone()
                .map_or_else(StepOutput::empty, StepOutput::with_output))
        })
    }
}

/// Compensation handler that records its calls and can be scripted to fail.
#[derive(Debug)]
pub struct RecordingCompensation {
    name: String,
    journal: CallJournal,
    failures: u32,
    calls: AtomicU32,
}

impl RecordingCompensation {
    /// A compensation that always succeeds.
    #[must_use]
    pub fn new(name: impl Into<String>, journal: &CallJournal) -> Self {
        Self {
            name: name.into(),
            journal: journal.clone(),
            failures: 0,
            calls: AtomicU32::new(0),
        }
    }

    /// Fail the first `n` invocations.
    #[must_use]
    pub const fn failing_first(mut self, n: u32) -> Self {
        self.failures = n;
        self
    }

    /// Fail every invocation.
    #[must_use]
    pub const fn always_failing(self) -> Self {
        self.failing_first(u32::MAX)
    }

    /// Invocations so far.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CompensationHandler for RecordingCompensation {
    fn compensate<'a>(&'a self, _ctx: &'a CompensationContext) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            self.journal.record(format!("compensate:{}", self.name));
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(HandlerError::new(format!("undo of {} failed", self.name)));
            }
            Ok(())
        })
    }
}

/// TCC participant with scripted outcomes per phase.
///
/// A successful Try reserves `{"participant": <name>}`.
#[derive(Debug)]
pub struct ScriptedParticipant {
    name: String,
    journal: CallJournal,
    try_failures: u32,
    try_retryable: bool,
    confirm_failures: u32,
    cancel_failures: u32,
    try_delay: Duration,
    try_calls: AtomicU32,
    confirm_calls: AtomicU32,
    cancel_calls: AtomicU32,
}

impl ScriptedParticipant {
    /// A participant whose every phase succeeds.
    #[must_use]
    pub fn new(name: impl Into<String>, journal: &CallJournal) -> Self {
        Self {
            name: name.into(),
            journal: journal.clone(),
            try_failures: 0,
            try_retryable: false,
            confirm_failures: 0,
            cancel_failures: 0,
            try_delay: Duration::ZERO,
            try_calls: AtomicU32::new(0),
            confirm_calls: AtomicU32::new(0),
            cancel_calls: AtomicU32::new(0),
        }
    }

    /// Refuse every Try.
    #[must_use]
    pub const fn refusing_try(mut self) -> Self {
        self.try_failures = u32::MAX;
        self.try_retryable = false;
        self
    }

    /// Fail the first `n` Trys with a retryable error.
    #[must_use]
    pub const fn failing_try(mut self, n: u32) -> Self {
        self.try_failures = n;
        self.try_retryable = true;
        self
    }

    /// Fail the first `n` confirms.
    #[must_use]
    pub const fn failing_confirm(mut self, n: u32) -> Self {
        self.confirm_failures = n;
        self
    }

    /// Fail the first `n` cancels.
    #[must_use]
    pub const fn failing_cancel(mut self, n: u32) -> Self {
        self.cancel_failures = n;
        self
    }

    /// Sleep this long inside every Try.
    #[must_use]
    pub const fn with_try_delay(mut self, delay: Duration) -> Self {
        self.try_delay = delay;
        self
    }

    fn reservation(&self) -> Value {
        json!({ "participant": self.name })
    }
}

impl TccParticipant for ScriptedParticipant {
    fn try_reserve<'a>(&'a self, _ctx: &'a ParticipantContext) -> BoxFuture<'a, Result<Option<Value>, HandlerError>> {
        Box::pin(async move {
            self.journal.record(format!("try:{}", self.name));
            if !self.try_delay.is_zero() {
                tokio::time::sleep(self.try_delay).await;
            }
            if self.try_calls.fetch_add(1, Ordering::SeqCst) < self.try_failures {
                let message = format!("{} refused", self.name);
                return Err(if self.try_retryable {
                    HandlerError::new(message)
                } else {
                    HandlerError::permanent(message)
                });
            }
            Ok(Some(self.reservation()))
        })
    }

    fn confirm<'a>(&'a self, ctx: &'a ParticipantContext) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            self.journal.record(format!("confirm:{}", self.name));
            if ctx.reservation.as_ref() != Some(&self.reservation()) {
                return Err(HandlerError::permanent("confirm without matching reservation"));
            }
            if self.confirm_calls.fetch_add(1, Ordering::SeqCst) < self.confirm_failures {
                return Err(HandlerError::new(format!("{} confirm failed", self.name)));
            }
            Ok(())
        })
    }

    fn cancel<'a>(&'a self, _ctx: &'a ParticipantContext) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            self.journal.record(format!("cancel:{}", self.name));
            if self.cancel_calls.fetch_add(1, Ordering::SeqCst) < self.cancel_failures {
                return Err(HandlerError::new(format!("{} cancel failed", self.name)));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Tests can unwrap

    use super::*;
    use sagaflow_core::id::ExecutionId;
    use std::collections::HashMap;

    fn ctx(attempt: u32) -> StepContext {
        StepContext::new(
            ExecutionId::new(),
            "a".into(),
            attempt,
            Arc::new(Value::Null),
            Arc::new(HashMap::new()),
            HashMap::new(),
            HashMap::new(),
        )
    }

    #[tokio::test]
    async fn test_scripted_step_fails_then_succeeds() {
        let journal = CallJournal::new();
        let step = ScriptedStep::new("a", &journal)
            .failing_first(1)
            .with_output(json!(1));

        assert!(step.execute(&ctx(1)).await.is_err());
        let output = step.execute(&ctx(2)).await.unwrap();

        assert_eq!(output.output(), Some(&json!(1)));
        assert_eq!(step.calls(), 2);
        assert_eq!(journal.count("step:a"), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retryable() {
        let step = ScriptedStep::new("a", &CallJournal::new())
            .always_failing()
            .permanent();
        assert!(!step.execute(&ctx(1)).await.unwrap_err().is_retryable());
    }
}
