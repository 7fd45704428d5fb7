//! In-memory execution store.
//!
//! The default persistence adapter. Records live in a map guarded by a single
//! lock, which makes the revision check and the write atomic.

use sagaflow_core::BoxFuture;
use sagaflow_core::execution::ExecutionRecord;
use sagaflow_core::id::ExecutionId;
use sagaflow_core::persistence::{ExecutionStore, PersistenceError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Execution store backed by a `HashMap`.
///
/// Suitable for tests and single-process deployments that accept losing state on
/// restart.
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    records: RwLock<HashMap<ExecutionId, ExecutionRecord>>,
}

impl InMemoryExecutionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Every stored record, in no particular order.
    pub async fn all(&self) -> Vec<ExecutionRecord> {
        self.records.read().await.values().cloned().collect()
    }
}

impl ExecutionStore for InMemoryExecutionStore {
    fn save(&self, record: ExecutionRecord) -> BoxFuture<'_, Result<(), PersistenceError>> {
        Box::pin(async move {
            let mut records = self.records.write().await;
            let id = record.id();
            let stored = records.get(&id).map_or(0, ExecutionRecord::revision);
            let expected = stored + 1;

            if record.revision() != expected {
                tracing::warn!(
                    execution_id = %id,
                    expected,
                    actual = record.revision(),
                    "Rejected out-of-order execution write"
                );
                return Err(PersistenceError::Conflict {
                    id,
                    expected,
                    actual: record.revision(),
                });
            }

            records.insert(id, record);
            Ok(())
        })
    }

    fn load(&self, id: ExecutionId) -> BoxFuture<'_, Result<Option<ExecutionRecord>, PersistenceError>> {
        Box::pin(async move { Ok(self.records.read().await.get(&id).cloned()) })
    }

    fn list_stale(
        &self,
        older_than: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<ExecutionRecord>, PersistenceError>> {
        Box::pin(async move {
            let records = self.records.read().await;
            let mut stale: Vec<ExecutionRecord> = records
                .values()
                .filter(|r| !r.is_terminal() && r.updated_at() < older_than)
                .cloned()
                .collect();
            stale.sort_by_key(ExecutionRecord::updated_at);
            Ok(stale)
        })
    }

    fn delete(&self, id: ExecutionId) -> BoxFuture<'_, Result<(), PersistenceError>> {
        Box::pin(async move {
            self.records.write().await.remove(&id);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sagaflow_core::context::StepOutput;
    use sagaflow_core::definition::{SagaDefinition, StepDefinition};
    use sagaflow_core::execution::{SagaExecution, SagaStatus};
    use sagaflow_core::handler::step_fn;
    use serde_json::json;

    fn execution(updated_at: DateTime<Utc>) -> SagaExecution {
        let definition = SagaDefinition::builder("order")
            .step(StepDefinition::new("a", step_fn(|_| async { Ok(StepOutput::empty()) })))
            .build()
            .unwrap();
        SagaExecution::new(&definition, json!({}), HashMap::new(), updated_at)
    }

    #[tokio::test]
    async fn test_save_requires_next_revision() {
        let store = InMemoryExecutionStore::new();
        let mut exec = execution(Utc::now());

        exec.revision = 2;
        let err = store.save(exec.clone().into()).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Conflict { expected: 1, actual: 2, .. }));

        exec.revision = 1;
        store.save(exec.clone().into()).await.unwrap();
        exec.revision = 2;
        store.save(exec.clone().into()).await.unwrap();

        // A stale writer replaying revision 2 loses.
        assert!(store.save(exec.clone().into()).await.is_err());
        assert_eq!(store.load(exec.id).await.unwrap().map(|r| r.revision()), Some(2));
    }

    #[tokio::test]
    async fn test_list_stale_skips_terminal_and_recent() {
        let store = InMemoryExecutionStore::new();
        let now = Utc::now();
        let old = now - chrono::Duration::minutes(10);

        let mut stale = execution(old);
        stale.revision = 1;
        stale.status = SagaStatus::Running;
        let mut done = execution(old);
        done.revision = 1;
        done.status = SagaStatus::Completed;
        let mut fresh = execution(now);
        fresh.revision = 1;

        for exec in [stale.clone(), done, fresh] {
            store.save(exec.into()).await.unwrap();
        }

        let found = store.list_stale(now - chrono::Duration::minutes(5)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), stale.id);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = InMemoryExecutionStore::new();
        let mut exec = execution(Utc::now());
        exec.revision = 1;
        store.save(exec.clone().into()).await.unwrap();

        store.delete(exec.id).await.unwrap();
        store.delete(exec.id).await.unwrap();
        assert!(store.is_empty().await);
    }
}
