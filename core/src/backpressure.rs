//! Backpressure port: admission control in front of the engines.
//!
//! Every submission asks the controller for an [`AdmissionPermit`] before any
//! execution state exists. A denied submission surfaces as
//! [`BackpressureRejected`] and leaves nothing behind. When the execution ends the
//! engine hands the permit back together with an [`AdmissionOutcome`], which
//! adaptive strategies use to tune their limits.
//!
//! The strategies themselves live in `sagaflow_runtime::backpressure`.

use crate::BoxFuture;
use std::time::Duration;
use thiserror::Error;

/// A submission was refused by the backpressure controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Submission of '{definition}' rejected by {strategy} backpressure: {reason}")]
pub struct BackpressureRejected {
    /// Definition the submission was for
    pub definition: String,
    /// Strategy that refused it
    pub strategy: &'static str,
    /// Why it was refused
    pub reason: String,
}

/// Proof of admission, returned on release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionPermit {
    definition: String,
    ticket: u64,
    probe: bool,
}

impl AdmissionPermit {
    /// Create a permit.
    #[must_use]
    pub fn new(definition: impl Into<String>, ticket: u64) -> Self {
        Self {
            definition: definition.into(),
            ticket,
            probe: false,
        }
    }

    /// Mark the permit as a half-open probe.
    #[must_use]
    pub const fn as_probe(mut self) -> Self {
        self.probe = true;
        self
    }

    /// Definition the permit was granted for.
    #[must_use]
    pub fn definition(&self) -> &str {
        &self.definition
    }

    /// Controller-assigned sequence number.
    #[must_use]
    pub const fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Whether the permit was granted as a half-open probe.
    #[must_use]
    pub const fn is_probe(&self) -> bool {
        self.probe
    }
}

/// How an admitted execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionOutcome {
    /// Whether the transaction reached its happy-path terminal status
    pub success: bool,
    /// Wall time from admission to release
    pub latency: Duration,
}

impl AdmissionOutcome {
    /// A successful outcome.
    #[must_use]
    pub const fn success(latency: Duration) -> Self {
        Self {
            success: true,
            latency,
        }
    }

    /// A failed outcome.
    #[must_use]
    pub const fn failure(latency: Duration) -> Self {
        Self {
            success: false,
            latency,
        }
    }
}

/// Admission controller.
///
/// Admission checks and counter updates must be atomic with respect to concurrent
/// submissions.
pub trait Backpressure: Send + Sync {
    /// Ask to start an execution of `definition`.
    ///
    /// May wait (batched strategies hold submissions until a batch forms).
    ///
    /// # Errors
    ///
    /// Returns [`BackpressureRejected`] if the submission must not run.
    fn admit<'a>(
        &'a self,
        definition: &'a str,
    ) -> BoxFuture<'a, Result<AdmissionPermit, BackpressureRejected>>;

    /// Return a permit once the execution ended.
    fn release(&self, permit: AdmissionPermit, outcome: AdmissionOutcome);

    /// Strategy name, for logs and metrics.
    fn name(&self) -> &'static str;
}
