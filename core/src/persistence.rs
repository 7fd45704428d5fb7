//! Persistence port for execution records.
//!
//! The engines write every state transition through an [`ExecutionStore`] before
//! proceeding, and the recovery service reads stale records back from it. The store
//! owns the durable projection of an execution; the engine owns the in-memory copy
//! during a run.
//!
//! # Optimistic Concurrency
//!
//! Each write carries the execution's `revision`. A store accepts a record only when
//! its revision is exactly one above the stored revision (or `1` for a new record),
//! and rejects it with [`PersistenceError::Conflict`] otherwise. Only one writer per
//! execution id can therefore make progress.

use crate::BoxFuture;
use crate::execution::ExecutionRecord;
use crate::id::ExecutionId;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during persistence operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// Optimistic concurrency conflict: the record's revision does not follow the
    /// stored one.
    ///
    /// This usually means another process resumed the same execution.
    #[error("Revision conflict for execution {id}: expected {expected}, got {actual}")]
    Conflict {
        /// Execution that was being written
        id: ExecutionId,
        /// Revision the store expected
        expected: u64,
        /// Revision carried by the rejected record
        actual: u64,
    },

    /// No record exists for the id.
    #[error("Execution not found: {0}")]
    NotFound(ExecutionId),

    /// Backend failure (connection, I/O, ...).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Durable storage for execution records.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the store can be shared as
/// `Arc<dyn ExecutionStore>` between engines and the recovery service.
pub trait ExecutionStore: Send + Sync {
    /// Insert or update a record.
    ///
    /// # Errors
    ///
    /// - `Conflict`: the revision is not the stored revision + 1
    /// - `Storage` / `Serialization`: backend failure
    fn save(&self, record: ExecutionRecord) -> BoxFuture<'_, Result<(), PersistenceError>>;

    /// Load a record by id. Returns `Ok(None)` if it does not exist.
    ///
    /// # Errors
    ///
    /// `Storage` / `Serialization` on backend failure.
    fn load(&self, id: ExecutionId) -> BoxFuture<'_, Result<Option<ExecutionRecord>, PersistenceError>>;

    /// Non-terminal records whose last update is older than `older_than`.
    ///
    /// # Errors
    ///
    /// `Storage` / `Serialization` on backend failure.
    fn list_stale(
        &self,
        older_than: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Vec<ExecutionRecord>, PersistenceError>>;

    /// Remove a record. Deleting a missing record is not an error.
    ///
    /// # Errors
    ///
    /// `Storage` on backend failure.
    fn delete(&self, id: ExecutionId) -> BoxFuture<'_, Result<(), PersistenceError>>;
}
