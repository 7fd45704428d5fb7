//! Recovery of abandoned executions.
//!
//! An execution whose record has not been updated for longer than the staleness
//! threshold is assumed to belong to a crashed process. The recovery service
//! finds such records through the persistence port and re-drives them with the
//! owning engine's `resume`.
//!
//! Recovery relies on handlers being idempotent: a step that was running when the
//! process died is invoked again.

use crate::error::EngineError;
use crate::registry::DefinitionRegistry;
use crate::saga::SagaEngine;
use crate::tcc::TccEngine;
use sagaflow_core::execution::ExecutionRecord;
use sagaflow_core::id::ExecutionId;
use std::sync::Arc;
use std::time::Duration;

/// What one recovery scan did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Stale records found
    pub scanned: usize,
    /// Executions re-driven, with the status they ended in
    pub resumed: Vec<(ExecutionId, String)>,
    /// Executions whose definition is not registered
    pub unknown_definitions: Vec<(ExecutionId, String)>,
    /// Executions that could not be resumed
    pub failed: Vec<(ExecutionId, String)>,
}

/// Finds stale executions and resumes them.
#[derive(Debug, Clone)]
pub struct RecoveryService {
    saga: SagaEngine,
    tcc: TccEngine,
    registry: Arc<DefinitionRegistry>,
}

impl RecoveryService {
    /// Create a recovery service over both engines.
    ///
    /// The staleness threshold and scan interval come from the Saga engine's config.
    #[must_use]
    pub const fn new(saga: SagaEngine, tcc: TccEngine, registry: Arc<DefinitionRegistry>) -> Self {
        Self { saga, tcc, registry }
    }

    /// Resume every execution not updated within the staleness threshold.
    ///
    /// Unknown definitions are reported, not fatal.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Persistence`] if the stale records cannot be listed.
    #[tracing::instrument(skip_all, name = "recover_stale")]
    pub async fn recover_stale(&self) -> Result<RecoveryReport, EngineError> {
        let ports = self.saga.ports();
        let threshold = chrono::Duration::from_std(self.saga.config().staleness_threshold)
            .unwrap_or(chrono::Duration::MAX);
        let older_than = ports
            .clock()
            .now()
            .checked_sub_signed(threshold)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);

        let stale = ports.store().list_stale(older_than).await?;
        metrics::counter!("recovery.scans").increment(1);

        let mut report = RecoveryReport {
            scanned: stale.len(),
            ..RecoveryReport::default()
        };
        if !stale.is_empty() {
            tracing::info!(count = stale.len(), "Found stale executions");
        }

        for record in stale {
            let id = record.id();
            match self.resume(record).await {
                Ok(resumed) => {
                    metrics::counter!("recovery.resumed").increment(1);
                    report.resumed.push((id, resumed.status_name()));
                }
                Err(EngineError::UnknownDefinition(name)) => {
                    tracing::warn!(execution_id = %id, definition = %name, "Cannot recover execution: definition not registered");
                    report.unknown_definitions.push((id, name));
                }
                Err(EngineError::ShuttingDown) => {
                    tracing::info!("Shutdown requested; stopping recovery scan");
                    break;
                }
                Err(error) => {
                    tracing::error!(execution_id = %id, error = %error, "Failed to recover execution");
                    metrics::counter!("recovery.failures").increment(1);
                    report.failed.push((id, error.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Resume one execution by id.
    ///
    /// Returns `None` if the store has no such execution. Terminal executions are
    /// returned unchanged.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Persistence`] if the record cannot be loaded
    /// - [`EngineError::UnknownDefinition`] if its definition is not registered
    /// - [`EngineError::ShuttingDown`] if shutdown was initiated
    pub async fn recover(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>, EngineError> {
        match self.saga.ports().store().load(id).await? {
            Some(record) => self.resume(record).await.map(Some),
            None => Ok(None),
        }
    }

    /// Scan every `recovery_interval` until shutdown.
    pub async fn run(&self) {
        let interval = self.saga.config().recovery_interval;
        tracing::info!(interval_secs = interval.as_secs(), "Recovery service started");

        while !self.saga.shutdown_signal().is_shutting_down() {
            if let Err(error) = self.recover_stale().await {
                tracing::error!(error = %error, "Recovery scan failed");
            }
            sleep_unless_shutdown(self, interval).await;
        }

        tracing::info!("Recovery service stopped");
    }

    async fn resume(&self, record: ExecutionRecord) -> Result<ExecutionRecord, EngineError> {
        if record.is_terminal() {
            return Ok(record);
        }
        match record {
            ExecutionRecord::Saga(execution) => {
                let definition = self.registry.saga(&execution.definition_name)?;
                self.saga
                    .resume(&definition, execution)
                    .await
                    .map(ExecutionRecord::Saga)
            }
            ExecutionRecord::Tcc(execution) => {
                let definition = self.registry.tcc(&execution.definition_name)?;
                self.tcc
                    .resume(&definition, execution)
                    .await
                    .map(ExecutionRecord::Tcc)
            }
        }
    }
}

/// Sleep for `interval`, waking early once shutdown is initiated.
async fn sleep_unless_shutdown(service: &RecoveryService, interval: Duration) {
    let poll = Duration::from_millis(100).min(interval);
    let deadline = tokio::time::Instant::now() + interval;
    while tokio::time::Instant::now() < deadline {
        if service.saga.shutdown_signal().is_shutting_down() {
            return;
        }
        tokio::time::sleep(poll).await;
    }
}
