//! Compensation-error handling.
//!
//! When an undo action (a Saga compensation or a TCC cancel) fails for good, the
//! engine asks the configured [`CompensationErrorHandler`] what to do next:
//!
//! - [`CompensationVerdict::Halt`]: stop dispatching further undo actions
//! - [`CompensationVerdict::Continue`]: record the failure and move on
//! - [`CompensationVerdict::Retry`]: back off and attempt the same action again

use crate::retry::{backoff_delay, retry_with_backoff};
use sagaflow_core::error::CompensationError;
use sagaflow_core::id::ExecutionId;
use sagaflow_core::retry::RetryPolicy;
use std::future::Future;

/// A final failure of one undo action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationFailure {
    /// Execution being unwound
    pub execution_id: ExecutionId,
    /// The error
    pub error: CompensationError,
    /// Retry verdicts already granted for this action
    pub retries_so_far: u32,
}

/// What to do after an undo action failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompensationVerdict {
    /// Stop dispatching undo actions
    Halt,
    /// Record the failure and continue with the next action
    Continue,
    /// Attempt the same action again after a backoff
    Retry,
}

/// Closed set of compensation-error strategies.
///
/// # Example
///
/// ```
/// use sagaflow_runtime::compensation_error::{
///     CompensationErrorHandler, CompensationFailure, CompensationVerdict,
/// };
/// use sagaflow_core::error::CompensationError;
/// use sagaflow_core::ExecutionId;
///
/// let handler = CompensationErrorHandler::Composite(vec![
///     CompensationErrorHandler::RetryWithBackoff { max_retries: 2 },
///     CompensationErrorHandler::LogAndContinue,
/// ]);
///
/// let failure = CompensationFailure {
///     execution_id: ExecutionId::new(),
///     error: CompensationError { target: "refund".into(), attempt: 1, message: "timeout".into() },
///     retries_so_far: 0,
/// };
/// assert_eq!(handler.handle(&failure), CompensationVerdict::Retry);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CompensationErrorHandler {
    /// Halt on the first failure
    FailFast,
    /// Log the failure and continue
    #[default]
    LogAndContinue,
    /// Retry up to `max_retries` times, then halt
    RetryWithBackoff {
        /// Retry verdicts granted per action
        max_retries: u32,
    },
    /// First non-`Continue` verdict of the inner handlers, else `Continue`
    Composite(Vec<CompensationErrorHandler>),
}

impl CompensationErrorHandler {
    /// Decide what to do about a failure.
    #[must_use]
    pub fn handle(&self, failure: &CompensationFailure) -> CompensationVerdict {
        match self {
            Self::FailFast => {
                tracing::error!(
                    execution_id = %failure.execution_id,
                    target = %failure.error.target,
                    error = %failure.error,
                    "Compensation failed; halting"
                );
                CompensationVerdict::Halt
            }
            Self::LogAndContinue => {
                tracing::warn!(
                    execution_id = %failure.execution_id,
                    target = %failure.error.target,
                    error = %failure.error,
                    "Compensation failed; continuing"
                );
                CompensationVerdict::Continue
            }
            Self::RetryWithBackoff { max_retries } => {
                if failure.retries_so_far < *max_retries {
                    CompensationVerdict::Retry
                } else {
                    tracing::error!(
                        execution_id = %failure.execution_id,
                        target = %failure.error.target,
                        retries = failure.retries_so_far,
                        "Compensation retries exhausted; halting"
                    );
                    CompensationVerdict::Halt
                }
            }
            Self::Composite(handlers) => handlers
                .iter()
                .map(|h| h.handle(failure))
                .find(|v| *v != CompensationVerdict::Continue)
                .unwrap_or(CompensationVerdict::Continue),
        }
    }
}

/// How one undo action ended after the handler had its say.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UndoOutcome {
    /// Handler invocations made
    pub attempts: u32,
    /// `None` on success, else the last error and the final verdict
    pub failure: Option<(CompensationError, CompensationVerdict)>,
}

/// Drive one undo action to completion.
///
/// `per_round` bounds the attempts made before the error handler is consulted;
/// `backoff` schedules the waits between rounds granted by `Retry` verdicts.
/// `attempt` receives the cumulative 1-based attempt number.
pub(crate) async fn undo<F, Fut>(
    handler: &CompensationErrorHandler,
    execution_id: ExecutionId,
    target: &str,
    per_round: &RetryPolicy,
    backoff: &RetryPolicy,
    mut attempt: F,
) -> UndoOutcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<(), String>>,
{
    let mut attempts = 0;
    let mut retries_so_far = 0;

    loop {
        let offset = attempts;
        let round = retry_with_backoff(per_round, |n| attempt(offset + n)).await;
        match round {
            Ok(((), made)) => {
                return UndoOutcome {
                    attempts: offset + made,
                    failure: None,
                };
            }
            Err(exhausted) => {
                attempts = offset + exhausted.attempts;
                let failure = CompensationFailure {
                    execution_id,
                    error: CompensationError {
                        target: target.to_string(),
                        attempt: attempts,
                        message: exhausted.error,
                    },
                    retries_so_far,
                };

                match handler.handle(&failure) {
                    CompensationVerdict::Retry => {
                        retries_so_far += 1;
                        let delay = backoff_delay(backoff, retries_so_far);
                        tracing::debug!(
                            target = %target,
                            retries_so_far,
                            delay_ms = delay.as_millis(),
                            "Retrying compensation"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    verdict => {
                        return UndoOutcome {
                            attempts,
                            failure: Some((failure.error, verdict)),
                        };
                    }
                }
            }
        }
    }
}
