//! Event sinks and best-effort delivery.

use sagaflow_core::BoxFuture;
use sagaflow_core::events::{EventSink, EventSinkError, LifecycleEvent};

/// Default events port: writes every lifecycle event to the `tracing` pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: LifecycleEvent) -> BoxFuture<'_, Result<(), EventSinkError>> {
        Box::pin(async move {
            match &event {
                LifecycleEvent::StepFailed { step_id, error, .. } => tracing::warn!(
                    event = event.name(),
                    execution_id = %event.execution_id(),
                    step_id = %step_id,
                    error = %error,
                    "Lifecycle event"
                ),
                LifecycleEvent::SagaFailed { error, .. } | LifecycleEvent::TccFailed { error, .. } => {
                    tracing::warn!(
                        event = event.name(),
                        execution_id = %event.execution_id(),
                        error = %error,
                        "Lifecycle event"
                    );
                }
                _ => tracing::info!(
                    event = event.name(),
                    execution_id = %event.execution_id(),
                    "Lifecycle event"
                ),
            }
            Ok(())
        })
    }
}

/// Deliver an event, logging instead of propagating sink failures.
///
/// Returns whether the sink acknowledged the event.
pub async fn emit_best_effort(sink: &dyn EventSink, event: LifecycleEvent) -> bool {
    let name = event.name();
    let execution_id = event.execution_id();
    match sink.emit(event).await {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(
                event = name,
                execution_id = %execution_id,
                error = %error,
                "Event sink failed; continuing"
            );
            metrics::counter!("events.emit.failures").increment(1);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sagaflow_core::ExecutionId;

    struct Broken;

    impl EventSink for Broken {
        fn emit(&self, _event: LifecycleEvent) -> BoxFuture<'_, Result<(), EventSinkError>> {
            Box::pin(async { Err(EventSinkError::Closed) })
        }
    }

    fn event() -> LifecycleEvent {
        LifecycleEvent::SagaStarted {
            execution_id: ExecutionId::new(),
            definition: "order".into(),
        }
    }

    #[tokio::test]
    async fn test_tracing_sink_acknowledges() {
        assert!(emit_best_effort(&TracingEventSink, event()).await);
    }

    #[tokio::test]
    async fn test_failing_sink_is_swallowed() {
        assert!(!emit_best_effort(&Broken, event()).await);
    }
}
