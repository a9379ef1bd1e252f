//! Exported governance signals.
//!
//! Counters and one gauge in a private Prometheus registry. The engine never
//! serves them; an external collector calls [`GovernanceSignals::render`].

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::governance::gates::GateName;
use crate::types::OperationMode;

/// Governance counters and the override-active gauge.
#[derive(Clone)]
pub struct GovernanceSignals {
    registry: Registry,
    mode_switch_attempts: IntCounterVec,
    gate_failures: IntCounterVec,
    override_events: IntCounterVec,
    signature_failures: IntCounter,
    quarantines: IntCounter,
    transient_errors: IntCounterVec,
    override_active: IntGauge,
}

impl std::fmt::Debug for GovernanceSignals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceSignals").finish_non_exhaustive()
    }
}

impl GovernanceSignals {
    /// Create and register every signal.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric descriptor is invalid or registered twice.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let mode_switch_attempts = IntCounterVec::new(
            Opts::new(
                "sovereign_mode_switch_attempts_total",
                "Mode switch attempts by target mode",
            ),
            &["target_mode"],
        )?;
        let gate_failures = IntCounterVec::new(
            Opts::new(
                "sovereign_gate_failures_total",
                "Preflight gate failures by gate",
            ),
            &["gate"],
        )?;
        let override_events = IntCounterVec::new(
            Opts::new(
                "sovereign_override_events_total",
                "Override begin/end/expire/reject events",
            ),
            &["action"],
        )?;
        let signature_failures = IntCounter::new(
            "sovereign_bundle_signature_failures_total",
            "Bundle validations that failed the signer policy",
        )?;
        let quarantines = IntCounter::new(
            "sovereign_bundle_quarantines_total",
            "Bundles moved into quarantine",
        )?;
        let transient_errors = IntCounterVec::new(
            Opts::new(
                "sovereign_transient_errors_total",
                "Retryable failures by source",
            ),
            &["source"],
        )?;
        let override_active = IntGauge::new(
            "sovereign_override_active",
            "1 while a governance override is active",
        )?;

        registry.register(Box::new(mode_switch_attempts.clone()))?;
        registry.register(Box::new(gate_failures.clone()))?;
        registry.register(Box::new(override_events.clone()))?;
        registry.register(Box::new(signature_failures.clone()))?;
        registry.register(Box::new(quarantines.clone()))?;
        registry.register(Box::new(transient_errors.clone()))?;
        registry.register(Box::new(override_active.clone()))?;

        Ok(Self {
            registry,
            mode_switch_attempts,
            gate_failures,
            override_events,
            signature_failures,
            quarantines,
            transient_errors,
            override_active,
        })
    }

    /// Count a transition attempt toward `target`.
    pub fn mode_switch_attempt(&self, target: OperationMode) {
        self.mode_switch_attempts
            .with_label_values(&[target.as_str()])
            .inc();
    }

    /// Count one failed gate.
    pub fn gate_failure(&self, gate: GateName) {
        self.gate_failures.with_label_values(&[gate.as_str()]).inc();
    }

    /// Count an override lifecycle event (`begin`, `end`, `expired`, `rejected`).
    pub fn override_event(&self, action: &str) {
        self.override_events.with_label_values(&[action]).inc();
    }

    /// Set the override-active gauge.
    pub fn set_override_active(&self, active: bool) {
        self.override_active.set(i64::from(active));
    }

    /// Count a validation that failed the signer policy.
    pub fn bundle_signature_failure(&self) {
        self.signature_failures.inc();
    }

    /// Count a bundle entering quarantine.
    pub fn bundle_quarantined(&self) {
        self.quarantines.inc();
    }

    /// Count a retryable failure (`network_probe`, `storage`, ...).
    pub fn transient_error(&self, source: &str) {
        self.transient_errors.with_label_values(&[source]).inc();
    }

    /// Mode switch attempts recorded so far for `target`.
    pub fn mode_switch_attempts(&self, target: OperationMode) -> u64 {
        self.mode_switch_attempts
            .with_label_values(&[target.as_str()])
            .get()
    }

    /// Failures recorded so far for `gate`.
    pub fn gate_failures(&self, gate: GateName) -> u64 {
        self.gate_failures.with_label_values(&[gate.as_str()]).get()
    }

    /// Bundles quarantined so far.
    pub fn quarantines(&self) -> u64 {
        self.quarantines.get()
    }

    /// Signature failures so far.
    pub fn signature_failures(&self) -> u64 {
        self.signature_failures.get()
    }

    /// Whether the override gauge is set.
    pub fn override_active(&self) -> bool {
        self.override_active.get() > 0
    }

    /// Prometheus text exposition of every signal.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
