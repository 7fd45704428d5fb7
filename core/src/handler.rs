//! Handler traits invoked by the engines.
//!
//! Handlers are the user-supplied business logic behind a step, a compensation or a
//! TCC participant. Definitions hold them as `Arc<dyn ...>`, so every method
//! returns a boxed future.
//!
//! For the common case of a closure, use [`step_fn`] and [`compensation_fn`].

use crate::BoxFuture;
use crate::context::{CompensationContext, ParticipantContext, StepContext, StepOutput};
use crate::error::HandlerError;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Forward action of a Saga step.
pub trait StepHandler: Send + Sync {
    /// Execute the step.
    ///
    /// Invoked once per attempt. A late completion after a timeout is discarded by
    /// the engine, so implementations should be idempotent with respect to retries.
    fn execute<'a>(&'a self, ctx: &'a StepContext) -> BoxFuture<'a, Result<StepOutput, HandlerError>>;
}

/// Undo action paired with a Saga step.
pub trait CompensationHandler: Send + Sync {
    /// Reverse the effects of a step that succeeded.
    fn compensate<'a>(&'a self, ctx: &'a CompensationContext) -> BoxFuture<'a, Result<(), HandlerError>>;
}

/// A resource manager taking part in a TCC transaction.
pub trait TccParticipant: Send + Sync {
    /// Tentatively reserve resources. The returned value is handed back to
    /// `confirm` and `cancel` as [`ParticipantContext::reservation`].
    fn try_reserve<'a>(
        &'a self,
        ctx: &'a ParticipantContext,
    ) -> BoxFuture<'a, Result<Option<Value>, HandlerError>>;

    /// Commit the reservation. Must be idempotent.
    fn confirm<'a>(&'a self, ctx: &'a ParticipantContext) -> BoxFuture<'a, Result<(), HandlerError>>;

    /// Release the reservation. Must be idempotent.
    fn cancel<'a>(&'a self, ctx: &'a ParticipantContext) -> BoxFuture<'a, Result<(), HandlerError>>;
}

/// Step handler backed by a closure.
///
/// Created with [`step_fn`].
pub struct FnStepHandler<F> {
    f: F,
}

impl<F, Fut> StepHandler for FnStepHandler<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutput, HandlerError>> + Send + 'static,
{
    fn execute<'a>(&'a self, ctx: &'a StepContext) -> BoxFuture<'a, Result<StepOutput, HandlerError>> {
        Box::pin((self.f)(ctx.clone()))
    }
}

/// Compensation handler backed by a closure.
///
/// Created with [`compensation_fn`].
pub struct FnCompensationHandler<F> {
    f: F,
}

impl<F, Fut> CompensationHandler for FnCompensationHandler<F>
where
    F: Fn(CompensationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn compensate<'a>(&'a self, ctx: &'a CompensationContext) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin((self.f)(ctx.clone()))
    }
}

/// Wrap a closure as a step handler.
///
/// The closure receives an owned clone of the context, so the returned future can
/// be `'static`.
///
/// # Example
///
/// ```
/// use sagaflow_core::handler::step_fn;
/// use sagaflow_core::context::StepOutput;
/// use serde_json::json;
///
/// let handler = step_fn(|ctx| async move {
///     let amount = ctx.input()["amount"].as_u64().unwrap_or_default();
///     Ok(StepOutput::with_output(json!({ "charged": amount })))
/// });
/// # let _ = handler;
/// ```
pub fn step_fn<F, Fut>(f: F) -> Arc<dyn StepHandler>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutput, HandlerError>> + Send + 'static,
{
    Arc::new(FnStepHandler { f })
}

/// Wrap a closure as a compensation handler.
pub fn compensation_fn<F, Fut>(f: F) -> Arc<dyn CompensationHandler>
where
    F: Fn(CompensationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnCompensationHandler { f })
}
