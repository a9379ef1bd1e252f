//! Mode governance: preflight gates, overrides, observers, and the mode
//! state machine that ties them to the bundle registry and the audit log.

pub mod controller;
pub mod gates;
pub mod observer;
pub mod overrides;

use thiserror::Error;

use crate::audit::AuditError;
use crate::bundle::BundleError;

pub use controller::{ModeController, ModeSnapshot, Rejection, RejectionKind, TransitionReport, TransitionRequest};
pub use gates::{GateFailure, GateName, IsolationProbe, PreflightGateChain, SystemIsolationProbe};
pub use observer::{GovernanceEvent, GovernanceObserver, LogObserver, ObserverSet};
pub use overrides::{OverrideError, OverrideGovernor, OverrideState};

/// Failures of governed operations other than mode transitions.
#[derive(Debug, Error)]
pub enum GovernanceError {
    /// The bundle registry refused or failed.
    #[error(transparent)]
    Bundle(#[from] BundleError),

    /// The decision could not be recorded.
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// A configuration patch was invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl GovernanceError {
    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Bundle(e) => e.is_transient(),
            Self::Audit(_) | Self::Config(_) => false,
        }
    }
}
