//! Recording and failing port implementations.

use sagaflow_core::BoxFuture;
use sagaflow_core::DateTime;
use sagaflow_core::Utc;
use sagaflow_core::events::{EventSink, EventSinkError, LifecycleEvent};
use sagaflow_core::execution::ExecutionRecord;
use sagaflow_core::id::ExecutionId;
use sagaflow_core::persistence::{ExecutionStore, PersistenceError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Event sink that keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingEventSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Names of every event received, oldest first.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(LifecycleEvent::name)
            .collect()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: LifecycleEvent) -> BoxFuture<'_, Result<(), EventSinkError>> {
        Box::pin(async move {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event);
            Ok(())
        })
    }
}

/// Event sink that rejects everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingEventSink;

impl EventSink for FailingEventSink {
    fn emit(&self, event: LifecycleEvent) -> BoxFuture<'_, Result<(), EventSinkError>> {
        Box::pin(async move { Err(EventSinkError::Delivery(format!("refused {}", event.name()))) })
    }
}

/// Store wrapper whose saves start failing after a set number of successes.
///
/// Reads and deletes always go to the inner store.
pub struct FailingExecutionStore {
    inner: Arc<dyn ExecutionStore>,
    allowed_saves: usize,
    saves: AtomicUsize,
}

impl FailingExecutionStore {
    /// Let `allowed_saves` saves through, then fail every save.
    #[must_use]
    pub fn new(inner: Arc<dyn ExecutionStore>, allowed_saves: usize) -> Self {
        Self {
            inner,
            allowed_saves,
            saves: AtomicUsize::new(0),
        }
    }

    /// Save attempts so far, failed ones included.
    #[must_use]
    pub fn save_attempts(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for FailingExecutionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailingExecutionStore")
            .field("allowed_saves", &self.allowed_saves)
            .field("saves", &self.save_attempts())
            .finish_non_exhaustive()
    }
}

impl ExecutionStore for FailingExecutionStore {
    fn save(&self, record: ExecutionRecord) -> BoxFuture<'_, Result<(), PersistenceError>> {
        Box::pin(async move {
            if self.saves.fetch_add(1, Ordering::SeqCst) >= self.allowed_saves {
                return Err(PersistenceError::Storage("injected save failure".into()));
            }
            self.inner.save(record).await
        })
    }

    fn load(&self, id: ExecutionId) -> BoxFuture<'_, Result<Option<ExecutionRecord>, PersistenceError>> {
        self.inner.load(id)
    }

    fn list_stale(
        &self,
        older_than: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<ExecutionRecord>, PersistenceError>> {
        self.inner.list_stale(older_than)
    }

    fn delete(&self, id: ExecutionId) -> BoxFuture<'_, Result<(), PersistenceError>> {
        self.inner.delete(id)
    }
}
