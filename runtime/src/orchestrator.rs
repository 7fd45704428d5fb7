//! Orchestrator facade.
//!
//! Bundles a Saga engine, a TCC engine, a definition registry and the recovery
//! service around one set of ports and one shutdown signal. Definitions are
//! registered once and submitted by name.
//!
//! # Example
//!
//! ```
//! use sagaflow_core::context::StepOutput;
//! use sagaflow_core::definition::{SagaDefinition, StepDefinition};
//! use sagaflow_core::handler::step_fn;
//! use sagaflow_runtime::config::EngineConfig;
//! use sagaflow_runtime::engine::EnginePorts;
//! use sagaflow_runtime::orchestrator::Orchestrator;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = Orchestrator::new(EnginePorts::in_memory(), EngineConfig::default());
//! orchestrator.register_saga(
//!     SagaDefinition::builder("ping")
//!         .step(StepDefinition::new("pong", step_fn(|_| async { Ok(StepOutput::empty()) })))
//!         .build()?,
//! );
//!
//! let execution = orchestrator.submit_saga("ping", serde_json::json!({})).await?;
//! assert!(execution.is_terminal());
//!
//! orchestrator.shutdown(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

use crate::backpressure::BackpressureStrategy;
use crate::config::{ConfigError, EngineConfig};
use crate::engine::{EnginePorts, ShutdownSignal};
use crate::error::EngineError;
use crate::persistence::InMemoryExecutionStore;
use crate::recovery::{RecoveryReport, RecoveryService};
use crate::registry::DefinitionRegistry;
use crate::saga::SagaEngine;
use crate::tcc::TccEngine;
use sagaflow_core::definition::{SagaDefinition, TccDefinition};
use sagaflow_core::execution::{ExecutionRecord, SagaExecution, TccExecution};
use sagaflow_core::id::ExecutionId;
use sagaflow_core::persistence::ExecutionStore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Entry point bundling both engines.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    saga: SagaEngine,
    tcc: TccEngine,
    registry: Arc<DefinitionRegistry>,
    recovery: RecoveryService,
    shutdown: ShutdownSignal,
}

impl Orchestrator {
    /// Create an orchestrator over the given ports.
    #[must_use]
    pub fn new(ports: EnginePorts, config: EngineConfig) -> Self {
        let shutdown = ShutdownSignal::new();
        let registry = Arc::new(DefinitionRegistry::new());
        let saga = SagaEngine::new(ports.clone(), config.clone()).with_shutdown(shutdown.clone());
        let tcc = TccEngine::new(ports, config).with_shutdown(shutdown.clone());
        let recovery = RecoveryService::new(saga.clone(), tcc.clone(), Arc::clone(&registry));

        Self {
            saga,
            tcc,
            registry,
            recovery,
            shutdown,
        }
    }

    /// Validate `config` and build an orchestrator over `store`, with the
    /// backpressure strategy the config names.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid.
    pub fn from_config(config: EngineConfig, store: Arc<dyn ExecutionStore>) -> Result<Self, ConfigError> {
        config.validate()?;
        let backpressure = BackpressureStrategy::from_name(&config.backpressure)?.build();
        tracing::info!(
            backpressure = backpressure.name(),
            retire_terminal = config.retire_terminal_executions,
            "Building orchestrator"
        );
        let ports = EnginePorts::new(store).with_backpressure(backpressure);
        Ok(Self::new(ports, config))
    }

    /// Build from `SAGAFLOW_*` environment variables over an in-memory store.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable fails to parse or validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_config(EngineConfig::from_env()?, Arc::new(InMemoryExecutionStore::new()))
    }

    /// Register a Saga definition under its name.
    pub fn register_saga(&self, definition: SagaDefinition) {
        if self.registry.register_saga(definition).is_some() {
            tracing::warn!("Replaced an existing saga definition");
        }
    }

    /// Register a TCC definition under its name.
    pub fn register_tcc(&self, definition: TccDefinition) {
        if self.registry.register_tcc(definition).is_some() {
            tracing::warn!("Replaced an existing TCC definition");
        }
    }

    /// Execute a registered Saga.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownDefinition`], plus the errors of
    /// [`SagaEngine::execute_with_headers`].
    pub async fn submit_saga(&self, name: &str, input: Value) -> Result<SagaExecution, EngineError> {
        self.submit_saga_with_headers(name, input, HashMap::new())
            .await
    }

    /// Execute a registered Saga with headers.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownDefinition`], plus the errors of
    /// [`SagaEngine::execute_with_headers`].
    pub async fn submit_saga_with_headers(
        &self,
        name: &str,
        input: Value,
        headers: HashMap<String, String>,
    ) -> Result<SagaExecution, EngineError> {
        let definition = self.registry.saga(name)?;
        self.saga
            .execute_with_headers(&definition, input, headers)
            .await
    }

    /// Execute a registered TCC transaction.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownDefinition`], plus the errors of [`TccEngine::execute`].
    pub async fn submit_tcc(&self, name: &str, input: Value) -> Result<TccExecution, EngineError> {
        let definition = self.registry.tcc(name)?;
        self.tcc.execute(&definition, input).await
    }

    /// Load an execution and re-drive it if it is not terminal.
    ///
    /// # Errors
    ///
    /// See [`RecoveryService::recover`].
    pub async fn resume(&self, id: ExecutionId) -> Result<Option<ExecutionRecord>, EngineError> {
        self.recovery.recover(id).await
    }

    /// Re-issue failed confirms of a stored TCC execution.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Persistence`] if the record cannot be loaded
    /// - [`EngineError::UnknownDefinition`] if its definition is not registered
    /// - [`EngineError::ShuttingDown`] if shutdown was initiated
    pub async fn retry_confirm(&self, id: ExecutionId) -> Result<Option<TccExecution>, EngineError> {
        let Some(ExecutionRecord::Tcc(execution)) = self.saga.ports().store().load(id).await? else {
            return Ok(None);
        };
        let definition = self.registry.tcc(&execution.definition_name)?;
        self.tcc.retry_confirm(&definition, execution).await.map(Some)
    }

    /// Run one recovery scan.
    ///
    /// # Errors
    ///
    /// See [`RecoveryService::recover_stale`].
    pub async fn recover_stale(&self) -> Result<RecoveryReport, EngineError> {
        self.recovery.recover_stale().await
    }

    /// Run the recovery loop on a background task until shutdown.
    #[must_use]
    pub fn spawn_recovery(&self) -> JoinHandle<()> {
        let recovery = self.recovery.clone();
        tokio::spawn(async move { recovery.run().await })
    }

    /// Stop accepting submissions and wait for in-flight executions.
    ///
    /// Executions stop at their next layer or phase boundary and stay in the store
    /// for recovery. Handlers are never aborted.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShutdownTimeout`] if executions are still running
    /// after `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), EngineError> {
        self.shutdown.drain(timeout).await
    }

    /// The Saga engine.
    #[must_use]
    pub const fn saga_engine(&self) -> &SagaEngine {
        &self.saga
    }

    /// The TCC engine.
    #[must_use]
    pub const fn tcc_engine(&self) -> &TccEngine {
        &self.tcc
    }

    /// The definition registry.
    #[must_use]
    pub fn registry(&self) -> &DefinitionRegistry {
        &self.registry
    }

    /// The shared shutdown signal.
    #[must_use]
    pub const fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }
}
