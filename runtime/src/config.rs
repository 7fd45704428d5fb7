//! Engine configuration.
//!
//! [`EngineConfig`] carries the knobs shared by both engines and the recovery
//! service. It can be built in code with the `with_*` builders or loaded from
//! `SAGAFLOW_*` environment variables.
//!
//! # Environment Variables
//!
//! | Variable | Field | Unit |
//! |---|---|---|
//! | `SAGAFLOW_IN_FLIGHT_GRACE_SECS` | `in_flight_grace` | seconds |
//! | `SAGAFLOW_STALENESS_THRESHOLD_SECS` | `staleness_threshold` | seconds |
//! | `SAGAFLOW_RECOVERY_INTERVAL_SECS` | `recovery_interval` | seconds |
//! | `SAGAFLOW_DEFAULT_STEP_TIMEOUT_MS` | `default_step_timeout` | milliseconds |
//! | `SAGAFLOW_RETIRE_TERMINAL` | `retire_terminal_executions` | `true`/`false` |
//! | `SAGAFLOW_BACKPRESSURE` | `backpressure` | strategy name |
//!
//! # Example
//!
//! ```
//! use sagaflow_runtime::config::EngineConfig;
//! use std::time::Duration;
//!
//! let config = EngineConfig::default()
//!     .with_in_flight_grace(Duration::from_secs(10))
//!     .with_retire_terminal_executions(true);
//!
//! assert!(config.validate().is_ok());
//! ```

use crate::backpressure::BackpressureStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Failed to parse an environment variable
    #[error("Failed to parse {var}: {reason}")]
    Parse {
        /// Variable name
        var: String,
        /// What was wrong with it
        reason: String,
    },

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    Validation(String),

    /// Unknown backpressure strategy name
    #[error("Unknown backpressure strategy: {0}")]
    UnknownStrategy(String),
}

/// Configuration shared by the engines and the recovery service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Interval between hang warnings while a failed layer waits for in-flight siblings
    pub in_flight_grace: Duration,
    /// Age after which a non-terminal execution is considered abandoned
    pub staleness_threshold: Duration,
    /// How often the recovery service scans for stale executions
    pub recovery_interval: Duration,
    /// Delete terminal executions once their terminal event was delivered
    pub retire_terminal_executions: bool,
    /// Timeout applied to steps that keep the definition default
    pub default_step_timeout: Duration,
    /// Backpressure strategy name
    pub backpressure: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            in_flight_grace: Duration::from_secs(30),
            staleness_threshold: Duration::from_secs(300),
            recovery_interval: Duration::from_secs(60),
            retire_terminal_executions: false,
            default_step_timeout: sagaflow_core::definition::DEFAULT_TIMEOUT,
            backpressure: "unbounded".to_string(),
        }
    }
}

impl EngineConfig {
    /// Set the hang-warning interval
    #[must_use]
    pub const fn with_in_flight_grace(mut self, grace: Duration) -> Self {
        self.in_flight_grace = grace;
        self
    }

    /// Set the staleness threshold
    #[must_use]
    pub const fn with_staleness_threshold(mut self, threshold: Duration) -> Self {
        self.staleness_threshold = threshold;
        self
    }

    /// Set the recovery scan interval
    #[must_use]
    pub const fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    /// Enable or disable retirement of terminal executions
    #[must_use]
    pub const fn with_retire_terminal_executions(mut self, retire: bool) -> Self {
        self.retire_terminal_executions = retire;
        self
    }

    /// Set the default step timeout
    #[must_use]
    pub const fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    /// Set the backpressure strategy name
    #[must_use]
    pub fn with_backpressure(mut self, strategy: impl Into<String>) -> Self {
        self.backpressure = strategy.into();
        self
    }

    /// Load configuration from `SAGAFLOW_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if a variable cannot be parsed or the result is invalid
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a variable cannot be parsed or the result is invalid
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64, _>(&lookup, "SAGAFLOW_IN_FLIGHT_GRACE_SECS")? {
            config.in_flight_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "SAGAFLOW_STALENESS_THRESHOLD_SECS")? {
            config.staleness_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "SAGAFLOW_RECOVERY_INTERVAL_SECS")? {
            config.recovery_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "SAGAFLOW_DEFAULT_STEP_TIMEOUT_MS")? {
            config.default_step_timeout = Duration::from_millis(ms);
        }
        if let Some(retire) = parse_var::<bool, _>(&lookup, "SAGAFLOW_RETIRE_TERMINAL")? {
            config.retire_terminal_executions = retire;
        }
        if let Some(name) = lookup("SAGAFLOW_BACKPRESSURE") {
            config.backpressure = name;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.in_flight_grace.is_zero() {
            return Err(ConfigError::Validation("in_flight_grace must be > 0".to_string()));
        }
        if self.staleness_threshold.is_zero() {
            return Err(ConfigError::Validation(
                "staleness_threshold must be > 0".to_string(),
            ));
        }
        if self.recovery_interval.is_zero() {
            return Err(ConfigError::Validation(
                "recovery_interval must be > 0".to_string(),
            ));
        }
        if self.default_step_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "default_step_timeout must be > 0".to_string(),
            ));
        }
        BackpressureStrategy::from_name(&self.backpressure)?;
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(var)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Parse {
                var: var.to_string(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.in_flight_grace, Duration::from_secs(30));
        assert!(!config.retire_terminal_executions);
    }

    #[test]
    fn test_reads_variables() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("SAGAFLOW_IN_FLIGHT_GRACE_SECS", "5"),
            ("SAGAFLOW_RETIRE_TERMINAL", "true"),
            ("SAGAFLOW_BACKPRESSURE", "adaptive"),
        ]))
        .unwrap();

        assert_eq!(config.in_flight_grace, Duration::from_secs(5));
        assert!(config.retire_terminal_executions);
        assert_eq!(config.backpressure, "adaptive");
    }

    #[test]
    fn test_rejects_unparsable_variable() {
        let err = EngineConfig::from_lookup(lookup(&[("SAGAFLOW_RECOVERY_INTERVAL_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_rejects_unknown_strategy() {
        let err = EngineConfig::default().with_backpressure("yolo").validate().unwrap_err();
        assert_eq!(err, ConfigError::UnknownStrategy("yolo".to_string()));
    }

    #[test]
    fn test_rejects_zero_grace() {
        let config = EngineConfig::default().with_in_flight_grace(Duration::ZERO);
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));
    }
}
