//! Definitions by name.
//!
//! Persisted executions only carry the name of their definition. Recovery and
//! the orchestrator resolve it here.

use crate::error::EngineError;
use sagaflow_core::definition::{SagaDefinition, TccDefinition};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Thread-safe map of Saga and TCC definitions.
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    sagas: RwLock<HashMap<String, Arc<SagaDefinition>>>,
    tccs: RwLock<HashMap<String, Arc<TccDefinition>>>,
}

impl DefinitionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a Saga definition, returning the one it replaced.
    pub fn register_saga(&self, definition: SagaDefinition) -> Option<Arc<SagaDefinition>> {
        let name = definition.name().to_string();
        tracing::debug!(definition = %name, "Registering saga definition");
        self.sagas
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(definition))
    }

    /// Register a TCC definition, returning the one it replaced.
    pub fn register_tcc(&self, definition: TccDefinition) -> Option<Arc<TccDefinition>> {
        let name = definition.name().to_string();
        tracing::debug!(definition = %name, "Registering TCC definition");
        self.tccs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(definition))
    }

    /// Look up a Saga definition.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownDefinition`] if none is registered under `name`.
    pub fn saga(&self, name: &str) -> Result<Arc<SagaDefinition>, EngineError> {
        self.sagas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDefinition(name.to_string()))
    }

    /// Look up a TCC definition.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownDefinition`] if none is registered under `name`.
    pub fn tcc(&self, name: &str) -> Result<Arc<TccDefinition>, EngineError> {
        self.tccs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDefinition(name.to_string()))
    }

    /// Names of every registered definition, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sagas
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .chain(self.tccs.read().unwrap_or_else(PoisonError::into_inner).keys())
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sagaflow_core::context::StepOutput;
    use sagaflow_core::definition::StepDefinition;
    use sagaflow_core::handler::step_fn;

    fn saga(name: &str) -> SagaDefinition {
        SagaDefinition::builder(name)
            .step(StepDefinition::new("a", step_fn(|_| async { Ok(StepOutput::empty()) })))
            .build()
            .unwrap()
    }

    #[test]
    fn test_register_replaces_by_name() {
        let registry = DefinitionRegistry::new();
        assert!(registry.register_saga(saga("order")).is_none());
        assert!(registry.register_saga(saga("order")).is_some());
        assert_eq!(registry.names(), vec!["order"]);
    }

    #[test]
    fn test_unknown_definition() {
        let registry = DefinitionRegistry::new();
        assert_eq!(
            registry.tcc("transfer").unwrap_err(),
            EngineError::UnknownDefinition("transfer".into())
        );
    }
}
