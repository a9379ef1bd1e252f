//! Zero-or-more subscribers for governance events.
//!
//! Observers are notified after the corresponding audit entry is written.
//! An empty set is a no-op.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::types::{OperationMode, TriggeredBy};

/// Event published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GovernanceEvent {
    /// A transition committed.
    ModeChanged {
        /// Mode before.
        from: OperationMode,
        /// Mode after.
        to: OperationMode,
        /// Active bundle after the change.
        bundle_id: Option<String>,
        /// Originator.
        triggered_by: TriggeredBy,
    },
    /// A bundle became the loaded bundle.
    BundleLoaded {
        /// Loaded bundle.
        bundle_id: String,
        /// Previously loaded bundle, now validated.
        demoted: Option<String>,
    },
    /// A bundle entered quarantine.
    BundleQuarantined {
        /// Quarantined bundle.
        bundle_id: String,
        /// Recorded reason.
        reason: Option<String>,
    },
}

/// Receives governance events. Must not block.
pub trait GovernanceObserver: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &GovernanceEvent);
}

/// Observer set owned by the controller.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn GovernanceObserver>>,
}

impl std::fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSet")
            .field("len", &self.observers.len())
            .finish()
    }
}

impl ObserverSet {
    /// Set over the given observers (possibly none).
    pub fn new(observers: Vec<Arc<dyn GovernanceObserver>>) -> Self {
        Self { observers }
    }

    /// Deliver `event` to every observer in registration order.
    pub fn notify(&self, event: &GovernanceEvent) {
        for observer in &self.observers {
            observer.on_event(event);
        }
    }

    /// Number of observers.
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Whether there are no observers.
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

/// Writes every event to the process log.
#[derive(Debug, Default)]
pub struct LogObserver;

impl GovernanceObserver for LogObserver {
    fn on_event(&self, event: &GovernanceEvent) {
        match event {
            GovernanceEvent::ModeChanged {
                from,
                to,
                bundle_id,
                triggered_by,
            } => info!(
                from = %from,
                to = %to,
                bundle_id = bundle_id.as_deref().unwrap_or_default(),
                triggered_by = %triggered_by,
                "governance: mode changed"
            ),
            GovernanceEvent::BundleLoaded { bundle_id, demoted } => info!(
                bundle_id = %bundle_id,
                demoted = demoted.as_deref().unwrap_or_default(),
                "governance: bundle loaded"
            ),
            GovernanceEvent::BundleQuarantined { bundle_id, reason } => info!(
                bundle_id = %bundle_id,
                reason = reason.as_deref().unwrap_or_default(),
                "governance: bundle quarantined"
            ),
        }
    }
}
