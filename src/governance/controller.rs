//! The mode state machine.
//!
//! One async lock serializes every transition, bundle load, quarantine
//! removal, and config patch. A decision is committed only after its audit
//! entry is appended; if the append fails, registry changes made on the way
//! are rolled back and the caller gets [`RejectionKind::AuditUnavailable`].
//! While the audit log is degraded no transition is accepted at all.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::MutexGuard;
use tracing::{error, info, warn};

use super::gates::{GateFailure, PreflightGateChain, Proposal};
use super::observer::{GovernanceEvent, ObserverSet};
use super::overrides::OverrideGovernor;
use super::GovernanceError;
use crate::audit::{AuditEventType, AuditLog, AuditRecord};
use crate::bundle::registry::{BundleRegistry, LoadOptions, LoadOutcome};
use crate::bundle::{Bundle, BundleError};
use crate::config::{ConfigPatch, GovernanceConfig, LiveConfig};
use crate::signals::GovernanceSignals;
use crate::types::{OperationMode, TriggeredBy};

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// A requested mode change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRequest {
    /// Desired mode.
    pub target: OperationMode,
    /// Bypass the gate chain. Only honored while an override is active.
    pub force: bool,
    /// Recorded on the audit entry.
    pub reason: String,
    /// Bundle for OFFLINE/SOVEREIGN; falls back to the active, then the
    /// configured fallback bundle.
    pub bundle_id: Option<String>,
    /// Originator.
    pub triggered_by: TriggeredBy,
    /// Apply only if the current mode equals this; otherwise do nothing.
    pub only_from: Option<OperationMode>,
}

impl TransitionRequest {
    /// Operator request with no bundle, force, or precondition.
    pub fn operator(target: OperationMode, reason: impl Into<String>) -> Self {
        Self {
            target,
            force: false,
            reason: reason.into(),
            bundle_id: None,
            triggered_by: TriggeredBy::Operator,
            only_from: None,
        }
    }

    /// Set the bundle reference.
    #[must_use]
    pub fn with_bundle(mut self, bundle_id: impl Into<String>) -> Self {
        self.bundle_id = Some(bundle_id.into());
        self
    }

    /// Request the gate bypass.
    #[must_use]
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Point-in-time view of the mode state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeSnapshot {
    /// Current mode.
    pub mode: OperationMode,
    /// Loaded bundle backing OFFLINE/SOVEREIGN.
    pub active_bundle: Option<String>,
    /// Last committed change.
    pub last_mode_change: Option<DateTime<Utc>>,
    /// Reason of the last committed change.
    pub last_reason: Option<String>,
}

/// Successful (or no-op) transition.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionReport {
    /// State after the call.
    pub snapshot: ModeSnapshot,
    /// Mode before the call.
    pub previous: OperationMode,
    /// Whether the mode or active bundle changed.
    pub changed: bool,
    /// The gates were bypassed under an override.
    pub forced: bool,
    /// Bundle load performed on the way.
    pub load: Option<LoadOutcome>,
    /// Audit entry id, if an entry was written.
    pub audit_id: Option<String>,
}

/// Rejection category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// The audit log is degraded or the decision could not be recorded.
    AuditUnavailable,
    /// Leaving QUARANTINE without an active override.
    QuarantineExitDenied,
    /// `force` requested without an active override.
    OverrideRequired,
    /// One or more preflight gates failed.
    GateFailure,
    /// The target bundle could not be loaded.
    BundleRejected,
    /// Bundle storage failed; retry later.
    Storage,
}

impl RejectionKind {
    /// Stable label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuditUnavailable => "audit_unavailable",
            Self::QuarantineExitDenied => "quarantine_exit_denied",
            Self::OverrideRequired => "override_required",
            Self::GateFailure => "gate_failure",
            Self::BundleRejected => "bundle_rejected",
            Self::Storage => "storage",
        }
    }
}

impl std::fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A refused transition. State is unchanged.
#[derive(Debug, Clone, Error, Serialize)]
#[error("transition {from} -> {target} rejected ({kind}): {}", .reasons.join("; "))]
pub struct Rejection {
    /// Category.
    pub kind: RejectionKind,
    /// Mode at the time (and after) the rejection.
    pub from: OperationMode,
    /// Requested mode.
    pub target: OperationMode,
    /// Every reason, in evaluation order.
    pub reasons: Vec<String>,
    /// Gate failures, when `kind` is `GateFailure`.
    pub gate_failures: Vec<GateFailure>,
}

impl Rejection {
    /// Whether retrying unchanged may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, RejectionKind::Storage)
    }
}

#[derive(Debug)]
struct ModeState {
    mode: OperationMode,
    active_bundle: Option<String>,
    last_mode_change: Option<DateTime<Utc>>,
    last_reason: Option<String>,
}

impl ModeState {
    fn snapshot(&self) -> ModeSnapshot {
        ModeSnapshot {
            mode: self.mode,
            active_bundle: self.active_bundle.clone(),
            last_mode_change: self.last_mode_change,
            last_reason: self.last_reason.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Collaborators of the controller.
pub struct ControllerDeps {
    /// Bundle lifecycle.
    pub registry: Arc<BundleRegistry>,
    /// Preflight gates.
    pub gates: PreflightGateChain,
    /// Override governor.
    pub overrides: Arc<OverrideGovernor>,
    /// Audit chain.
    pub audit: Arc<AuditLog>,
    /// Live configuration.
    pub config: LiveConfig,
    /// Exported signals.
    pub signals: GovernanceSignals,
    /// Event subscribers.
    pub observers: ObserverSet,
}

/// The governance state machine.
pub struct ModeController {
    state: tokio::sync::Mutex<ModeState>,
    registry: Arc<BundleRegistry>,
    gates: PreflightGateChain,
    overrides: Arc<OverrideGovernor>,
    audit: Arc<AuditLog>,
    config: LiveConfig,
    signals: GovernanceSignals,
    observers: ObserverSet,
    switches: Mutex<BTreeMap<OperationMode, u64>>,
}

impl ModeController {
    /// Start in ONLINE with no active bundle.
    pub fn new(deps: ControllerDeps) -> Self {
        Self {
            state: tokio::sync::Mutex::new(ModeState {
                mode: OperationMode::Online,
                active_bundle: None,
                last_mode_change: None,
                last_reason: None,
            }),
            registry: deps.registry,
            gates: deps.gates,
            overrides: deps.overrides,
            audit: deps.audit,
            config: deps.config,
            signals: deps.signals,
            observers: deps.observers,
            switches: Mutex::new(BTreeMap::new()),
        }
    }

    /// Current state.
    pub async fn snapshot(&self) -> ModeSnapshot {
        self.state.lock().await.snapshot()
    }

    /// Committed mode switches by target mode.
    pub fn switch_counts(&self) -> BTreeMap<OperationMode, u64> {
        match self.switches.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Deliver an event to the observers.
    pub fn notify(&self, event: &GovernanceEvent) {
        self.observers.notify(event);
    }

    /// Audit and publish a bundle that has just entered quarantine.
    ///
    /// Quarantine is always recorded, whatever the audit toggles say. The
    /// quarantine itself stands even when the entry cannot be written.
    pub fn record_quarantine(
        &self,
        bundle_id: &str,
        reason: Option<String>,
        errors: &[String],
        triggered_by: TriggeredBy,
    ) {
        let record = AuditRecord::new(
            AuditEventType::BundleQuarantined,
            triggered_by,
            reason.clone().unwrap_or_default(),
        )
        .bundle(Some(bundle_id.to_owned()))
        .metadata(serde_json::json!({ "errors": errors }));
        if let Err(e) = self.audit.append(record) {
            error!(error = %e, bundle_id = %bundle_id, "failed to audit bundle quarantine");
        }
        self.observers.notify(&GovernanceEvent::BundleQuarantined {
            bundle_id: bundle_id.to_owned(),
            reason,
        });
    }

    /// Drop `bundle_id` as the active bundle without a mode change.
    ///
    /// Used when the active bundle lost trust and QUARANTINE could not be
    /// entered. Returns whether it was the active bundle.
    pub async fn detach_bundle(&self, bundle_id: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.active_bundle.as_deref() != Some(bundle_id) {
            return false;
        }
        state.active_bundle = None;
        error!(
            mode = %state.mode,
            bundle_id = %bundle_id,
            "active bundle is no longer trusted; mode has no backing bundle until the next transition"
        );
        true
    }

    fn record_load_quarantine(&self, error: &BundleError, triggered_by: TriggeredBy) {
        if let BundleError::LoadRejected {
            id,
            reasons,
            quarantined: true,
            ..
        } = error
        {
            self.record_quarantine(id, Some(reasons.join("; ")), reasons, triggered_by);
        }
    }

    // -----------------------------------------------------------------------
    // Transition
    // -----------------------------------------------------------------------

    /// Perform a governed transition.
    ///
    /// # Errors
    ///
    /// Returns a [`Rejection`] carrying every reason; the mode, the active
    /// bundle, and bundle statuses are left as they were.
    pub async fn transition(&self, request: TransitionRequest) -> Result<TransitionReport, Rejection> {
        let mut state = self.state.lock().await;
        let from = state.mode;
        let target = request.target;

        if let Some(expected) = request.only_from {
            if expected != from {
                return Ok(TransitionReport {
                    snapshot: state.snapshot(),
                    previous: from,
                    changed: false,
                    forced: false,
                    load: None,
                    audit_id: None,
                });
            }
        }

        self.signals.mode_switch_attempt(target);

        if let Some(reason) = self.audit.degraded_reason() {
            error!(from = %from, target = %target, "transition refused: audit log unavailable");
            return Err(Rejection {
                kind: RejectionKind::AuditUnavailable,
                from,
                target,
                reasons: vec![format!("audit log unavailable: {reason}")],
                gate_failures: Vec::new(),
            });
        }

        // Entering QUARANTINE never needs (or consumes) the override.
        let force = request.force && target != OperationMode::Quarantine;
        let override_active = self.overrides.active().is_some();

        if target == from && !force {
            let record = AuditRecord::new(AuditEventType::ModeChange, request.triggered_by, &request.reason)
                .modes(from, target)
                .bundle(state.active_bundle.clone())
                .metadata(serde_json::json!({ "noop": true }));
            let entry = self.append_or_reject(record, from, target)?;
            info!(mode = %from, "transition requested to current mode, nothing to do");
            return Ok(TransitionReport {
                snapshot: state.snapshot(),
                previous: from,
                changed: false,
                forced: false,
                load: None,
                audit_id: Some(entry.id),
            });
        }

        if from == OperationMode::Quarantine && target != OperationMode::Quarantine && !(force && override_active) {
            return Err(self.reject(
                &state,
                &request,
                RejectionKind::QuarantineExitDenied,
                vec!["leaving quarantine requires force under an active override".to_owned()],
                Vec::new(),
                None,
            ));
        }

        if force && !override_active {
            return Err(self.reject(
                &state,
                &request,
                RejectionKind::OverrideRequired,
                vec!["force requires an active override".to_owned()],
                Vec::new(),
                None,
            ));
        }

        let config = self.config.snapshot();
        let bundle_ref = resolve_bundle_ref(&state, &request, &config);
        let triggered_by = if force {
            TriggeredBy::Override
        } else {
            request.triggered_by
        };

        if !force {
            let bundle = match &bundle_ref {
                Some(id) => match self.registry.get(id).await {
                    Ok(bundle) => bundle,
                    Err(e) => {
                        self.signals.transient_error("storage");
                        return Err(self.reject(
                            &state,
                            &request,
                            RejectionKind::Storage,
                            vec![e.to_string()],
                            Vec::new(),
                            bundle_ref.clone(),
                        ));
                    }
                },
                None => None,
            };
            let report = self
                .gates
                .evaluate(&Proposal {
                    current: from,
                    target,
                    bundle_id: bundle_ref.as_deref(),
                    bundle: bundle.as_ref(),
                })
                .await;
            if !report.passed() {
                for failure in &report.failures {
                    self.signals.gate_failure(failure.gate);
                }
                let reasons = report.failures.iter().map(ToString::to_string).collect();
                return Err(self.reject(
                    &state,
                    &request,
                    RejectionKind::GateFailure,
                    reasons,
                    report.failures,
                    bundle_ref,
                ));
            }
        }

        let previously_loaded = match self.registry.loaded().await {
            Ok(loaded) => loaded.map(|b| b.id),
            Err(e) => {
                self.signals.transient_error("storage");
                return Err(self.reject(
                    &state,
                    &request,
                    RejectionKind::Storage,
                    vec![e.to_string()],
                    Vec::new(),
                    bundle_ref,
                ));
            }
        };

        // Load for bundle-backed targets.
        let mut load = None;
        if target.requires_bundle() {
            let Some(id) = bundle_ref.clone() else {
                return Err(self.reject(
                    &state,
                    &request,
                    RejectionKind::BundleRejected,
                    vec!["no bundle specified and no fallback bundle configured".to_owned()],
                    Vec::new(),
                    None,
                ));
            };
            match self.registry.load(&id, LoadOptions::default()).await {
                Ok(outcome) => load = Some(outcome),
                Err(e) => {
                    self.record_load_quarantine(&e, triggered_by);
                    let kind = if e.is_transient() {
                        self.signals.transient_error("storage");
                        RejectionKind::Storage
                    } else {
                        RejectionKind::BundleRejected
                    };
                    return Err(self.reject(&state, &request, kind, load_reasons(&e), Vec::new(), Some(id)));
                }
            }
        }

        // Unload when leaving bundle-backed modes.
        let mut unloaded = None;
        if from.requires_bundle() && !target.requires_bundle() {
            if let Some(active) = state.active_bundle.clone() {
                match self.registry.unload(&active).await {
                    Ok(true) => unloaded = Some(active),
                    Ok(false) => {}
                    Err(e) => {
                        self.signals.transient_error("storage");
                        return Err(self.reject(
                            &state,
                            &request,
                            RejectionKind::Storage,
                            vec![e.to_string()],
                            Vec::new(),
                            Some(active),
                        ));
                    }
                }
            }
        }

        let new_active = load.as_ref().map(|l| l.bundle.id.clone());
        let record = AuditRecord::new(AuditEventType::ModeChange, triggered_by, &request.reason)
            .modes(from, target)
            .bundle(new_active.clone().or_else(|| unloaded.clone()))
            .metadata(serde_json::json!({
                "forced": force,
                "requested_by": request.triggered_by,
                "demoted": load.as_ref().and_then(|l| l.demoted.clone()),
                "unloaded": unloaded,
            }));

        let entry = match self.audit.append(record) {
            Ok(entry) => entry,
            Err(e) => {
                error!(error = %e, from = %from, target = %target, "transition not committed: audit write failed");
                self.roll_back(previously_loaded.as_deref(), load.as_ref(), unloaded.as_deref())
                    .await;
                return Err(Rejection {
                    kind: RejectionKind::AuditUnavailable,
                    from,
                    target,
                    reasons: vec![e.to_string()],
                    gate_failures: Vec::new(),
                });
            }
        };

        state.mode = target;
        state.active_bundle = new_active.clone();
        state.last_mode_change = Some(entry.timestamp);
        state.last_reason = Some(request.reason.clone());
        self.count_switch(target);

        info!(
            from = %from,
            to = %target,
            bundle_id = new_active.as_deref().unwrap_or_default(),
            triggered_by = %triggered_by,
            forced = force,
            "mode transition committed"
        );

        if let Some(outcome) = load.as_ref().filter(|l| !l.already_loaded) {
            self.observers.notify(&GovernanceEvent::BundleLoaded {
                bundle_id: outcome.bundle.id.clone(),
                demoted: outcome.demoted.clone(),
            });
        }
        self.observers.notify(&GovernanceEvent::ModeChanged {
            from,
            to: target,
            bundle_id: new_active,
            triggered_by,
        });

        Ok(TransitionReport {
            snapshot: state.snapshot(),
            previous: from,
            changed: true,
            forced: force,
            load,
            audit_id: Some(entry.id),
        })
    }

    /// Audit a rejection and build it.
    fn reject(
        &self,
        state: &ModeState,
        request: &TransitionRequest,
        kind: RejectionKind,
        reasons: Vec<String>,
        gate_failures: Vec<GateFailure>,
        bundle_id: Option<String>,
    ) -> Rejection {
        let rejection = Rejection {
            kind,
            from: state.mode,
            target: request.target,
            reasons,
            gate_failures,
        };
        warn!(
            from = %rejection.from,
            target = %rejection.target,
            kind = %kind,
            reasons = %rejection.reasons.join("; "),
            "transition rejected"
        );

        let record = AuditRecord::new(AuditEventType::ModeChange, request.triggered_by, &request.reason)
            .modes(state.mode, state.mode)
            .bundle(bundle_id)
            .failed(rejection.to_string())
            .metadata(serde_json::json!({
                "requested_mode": request.target,
                "forced": request.force,
                "kind": kind,
                "reasons": rejection.reasons,
                "gate_failures": rejection.gate_failures,
            }));
        if let Err(e) = self.audit.append(record) {
            error!(error = %e, "failed to audit transition rejection");
        }
        rejection
    }

    fn append_or_reject(
        &self,
        record: AuditRecord,
        from: OperationMode,
        target: OperationMode,
    ) -> Result<crate::audit::AuditEntry, Rejection> {
        self.audit.append(record).map_err(|e| Rejection {
            kind: RejectionKind::AuditUnavailable,
            from,
            target,
            reasons: vec![e.to_string()],
            gate_failures: Vec::new(),
        })
    }

    async fn roll_back(
        &self,
        previously_loaded: Option<&str>,
        load: Option<&LoadOutcome>,
        unloaded: Option<&str>,
    ) {
        let promoted = load.filter(|l| !l.already_loaded).map(|l| l.bundle.id.as_str());
        let restore_loaded = if promoted.is_some() { previously_loaded } else { unloaded };
        if promoted.is_none() && restore_loaded.is_none() {
            return;
        }
        if let Err(e) = self.registry.reinstate(restore_loaded, promoted).await {
            error!(error = %e, "failed to roll back bundle state after audit failure");
        }
    }

    fn count_switch(&self, target: OperationMode) {
        let mut switches = self.switches.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = switches.entry(target).or_insert(0);
        *count = count.saturating_add(1);
    }

    // -----------------------------------------------------------------------
    // Serialized bundle and config operations
    // -----------------------------------------------------------------------

    async fn lock_governed(&self) -> Result<MutexGuard<'_, ModeState>, GovernanceError> {
        let state = self.state.lock().await;
        if let Some(reason) = self.audit.degraded_reason() {
            return Err(GovernanceError::Audit(crate::audit::AuditError::Degraded(reason)));
        }
        Ok(state)
    }

    /// Load a bundle under the transition lock.
    ///
    /// In OFFLINE/SOVEREIGN the loaded bundle becomes the active bundle.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError::Bundle`] for registry refusals and
    /// [`GovernanceError::Audit`] when the decision cannot be recorded
    /// (the load is rolled back then).
    pub async fn load_bundle(
        &self,
        id: &str,
        options: LoadOptions,
        triggered_by: TriggeredBy,
        reason: &str,
    ) -> Result<LoadOutcome, GovernanceError> {
        let mut state = self.lock_governed().await?;
        let previously_loaded = self.registry.loaded().await?.map(|b| b.id);

        let outcome = match self.registry.load(id, options).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record_load_quarantine(&e, triggered_by);
                let record = AuditRecord::new(AuditEventType::BundleLoad, triggered_by, reason)
                    .bundle(Some(id.to_owned()))
                    .failed(e.to_string())
                    .metadata(serde_json::json!({
                        "force_revalidate": options.force_revalidate,
                        "skip_quarantine_check": options.skip_quarantine_check,
                    }));
                if let Err(audit_err) = self.audit.append(record) {
                    error!(error = %audit_err, "failed to audit bundle load rejection");
                }
                return Err(e.into());
            }
        };

        let record = AuditRecord::new(AuditEventType::BundleLoad, triggered_by, reason)
            .bundle(Some(id.to_owned()))
            .metadata(serde_json::json!({
                "demoted": outcome.demoted,
                "already_loaded": outcome.already_loaded,
                "load_count": outcome.bundle.load_count,
            }));
        if let Err(e) = self.audit.append(record) {
            if !outcome.already_loaded {
                if let Err(rb) = self.registry.reinstate(previously_loaded.as_deref(), Some(id)).await {
                    error!(error = %rb, "failed to roll back bundle load after audit failure");
                }
            }
            return Err(e.into());
        }

        if state.mode.requires_bundle() {
            state.active_bundle = Some(outcome.bundle.id.clone());
        }
        if !outcome.already_loaded {
            self.observers.notify(&GovernanceEvent::BundleLoaded {
                bundle_id: outcome.bundle.id.clone(),
                demoted: outcome.demoted.clone(),
            });
        }
        Ok(outcome)
    }

    /// Clear quarantine on a bundle (back to pending) under the transition lock.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError::Bundle`] (e.g. not quarantined) or
    /// [`GovernanceError::Audit`] when the action cannot be recorded (the
    /// quarantine is restored then).
    pub async fn remove_quarantine(
        &self,
        id: &str,
        triggered_by: TriggeredBy,
        reason: &str,
    ) -> Result<Bundle, GovernanceError> {
        let _state = self.lock_governed().await?;
        let before = self.registry.get(id).await?;

        let cleared = match self.registry.remove_quarantine(id).await {
            Ok(bundle) => bundle,
            Err(e) => {
                let record = AuditRecord::new(AuditEventType::QuarantineRemoved, triggered_by, reason)
                    .bundle(Some(id.to_owned()))
                    .failed(e.to_string());
                if let Err(audit_err) = self.audit.append(record) {
                    error!(error = %audit_err, "failed to audit quarantine removal rejection");
                }
                return Err(e.into());
            }
        };

        let previous_reason = before.as_ref().and_then(|b| b.quarantine_reason.clone());
        let record = AuditRecord::new(AuditEventType::QuarantineRemoved, triggered_by, reason)
            .bundle(Some(id.to_owned()))
            .metadata(serde_json::json!({ "previous_reason": previous_reason }));
        if let Err(e) = self.audit.append(record) {
            if let Some(snapshot) = before {
                if let Err(rb) = self.registry.restore_lifecycle(&snapshot).await {
                    error!(error = %rb, "failed to restore quarantine after audit failure");
                }
            }
            return Err(e.into());
        }
        Ok(cleared)
    }

    /// Validate and apply a config patch under the transition lock.
    ///
    /// # Errors
    ///
    /// Returns [`GovernanceError::Config`] for an invalid patch (nothing
    /// changes) or [`GovernanceError::Audit`] when the change cannot be
    /// recorded (the previous config is restored then).
    pub async fn update_config(
        &self,
        patch: &ConfigPatch,
        triggered_by: TriggeredBy,
        reason: &str,
    ) -> Result<GovernanceConfig, GovernanceError> {
        let _state = self.lock_governed().await?;

        let (changed, previous) = match self.config.apply(patch) {
            Ok(applied) => applied,
            Err(e) => {
                let message = format!("{e:#}");
                let record = AuditRecord::new(AuditEventType::ConfigChange, triggered_by, reason)
                    .failed(message.clone());
                if let Err(audit_err) = self.audit.append(record) {
                    error!(error = %audit_err, "failed to audit config rejection");
                }
                return Err(GovernanceError::Config(message));
            }
        };

        let record = AuditRecord::new(AuditEventType::ConfigChange, triggered_by, reason)
            .metadata(serde_json::json!({ "changed": changed }));
        if let Err(e) = self.audit.append(record) {
            self.config.replace(previous);
            return Err(e.into());
        }
        info!(changed = ?changed, "configuration updated");
        Ok(self.config.snapshot())
    }
}

/// Bundle for a bundle-backed target: request, then active, then fallback.
fn resolve_bundle_ref(
    state: &ModeState,
    request: &TransitionRequest,
    config: &GovernanceConfig,
) -> Option<String> {
    if !request.target.requires_bundle() {
        return None;
    }
    request
        .bundle_id
        .clone()
        .or_else(|| {
            state
                .mode
                .requires_bundle()
                .then(|| state.active_bundle.clone())
                .flatten()
        })
        .or_else(|| config.fallback.fallback_bundle_id.clone())
}

fn load_reasons(error: &BundleError) -> Vec<String> {
    match error {
        BundleError::LoadRejected { reasons, .. } if !reasons.is_empty() => reasons.clone(),
        other => vec![other.to_string()],
    }
}
