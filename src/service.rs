//! The single owner object wiring configuration, storage, the audit chain,
//! the network monitor, and the mode controller together.
//!
//! Every logical operation an outer surface (REST layer, CLI) needs is a
//! method here. The periodic connectivity loop runs as a background task
//! driven by [`SovereignService::spawn_network_monitor`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::audit::{AuditEntry, AuditError, AuditEventType, AuditLog, AuditQuery, AuditRecord, ChainBreak};
use crate::bundle::registry::{BundleRegistry, DiscoveryReport, LoadOptions, LoadOutcome, ValidationOutcome};
use crate::bundle::store::BundleStore;
use crate::bundle::{Bundle, BundleError};
use crate::config::{ConfigPatch, GovernanceConfig, LiveConfig};
use crate::governance::controller::ControllerDeps;
use crate::governance::{
    GovernanceError, IsolationProbe, LogObserver, ModeController, ModeSnapshot, ObserverSet,
    OverrideError, OverrideGovernor, OverrideState, PreflightGateChain, Rejection, SystemIsolationProbe,
    TransitionReport, TransitionRequest,
};
use crate::network::{NetworkCheckResult, NetworkMonitor, Observation};
use crate::signals::GovernanceSignals;
use crate::types::{BundleStatus, OperationMode, TriggeredBy};

/// Reason recorded when a failed re-validation forces QUARANTINE.
pub const REVALIDATION_QUARANTINE_REASON: &str = "active bundle failed re-validation";

/// Reason recorded on automatic fallback transitions.
pub const FALLBACK_REASON: &str = "network connectivity lost";

/// Collaborators injected into [`SovereignService::new`].
pub struct ServiceDeps {
    /// Live configuration.
    pub config: LiveConfig,
    /// Bundle registry.
    pub registry: Arc<BundleRegistry>,
    /// Audit chain.
    pub audit: Arc<AuditLog>,
    /// Connectivity monitor.
    pub monitor: Arc<NetworkMonitor>,
    /// Host isolation checks.
    pub isolation: Arc<dyn IsolationProbe>,
    /// Event subscribers.
    pub observers: ObserverSet,
    /// Exported signals.
    pub signals: GovernanceSignals,
}

/// Current governance status.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    /// Current mode.
    pub mode: OperationMode,
    /// Online flag of the last connectivity check, if any ran.
    pub online: Option<bool>,
    /// Bundle backing OFFLINE/SOVEREIGN.
    pub active_bundle: Option<String>,
    /// All registered bundles.
    pub available_bundles: u64,
    /// Bundles that are validated or loaded.
    pub validated_bundles: u64,
    /// Quarantined bundles.
    pub quarantined_bundles: u64,
    /// Last connectivity check.
    pub last_network_check: Option<NetworkCheckResult>,
    /// Last committed mode change.
    pub last_mode_change: Option<DateTime<Utc>>,
    /// Reason of the last committed mode change.
    pub last_reason: Option<String>,
    /// Active override.
    pub active_override: Option<OverrideState>,
    /// Set while the audit log refuses writes.
    pub audit_degraded: Option<String>,
    /// Live configuration.
    pub config: GovernanceConfig,
}

/// Aggregate counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Statistics {
    /// Bundles per status.
    pub bundles_by_status: BTreeMap<BundleStatus, u64>,
    /// Committed mode switches per target mode.
    pub mode_switches: BTreeMap<OperationMode, u64>,
    /// Audit entries per event type.
    pub audit_events: BTreeMap<AuditEventType, u64>,
    /// Total audit entries.
    pub audit_entries: usize,
}

/// What one periodic network tick did.
#[derive(Debug)]
pub struct NetworkTick {
    /// The periodic check and its previous verdict.
    pub observation: Observation,
    /// Automatic fallback transition, when one was attempted.
    pub fallback: Option<Result<TransitionReport, Rejection>>,
}

/// Sovereign mode governance service.
pub struct SovereignService {
    config: LiveConfig,
    registry: Arc<BundleRegistry>,
    audit: Arc<AuditLog>,
    monitor: Arc<NetworkMonitor>,
    overrides: Arc<OverrideGovernor>,
    controller: ModeController,
    signals: GovernanceSignals,
}

impl SovereignService {
    /// Wire a service from explicit collaborators. Starts in ONLINE.
    pub fn new(deps: ServiceDeps) -> Self {
        let overrides = Arc::new(OverrideGovernor::new(
            Arc::clone(&deps.audit),
            deps.config.clone(),
            deps.signals.clone(),
        ));
        let controller = ModeController::new(ControllerDeps {
            registry: Arc::clone(&deps.registry),
            gates: PreflightGateChain::new(Arc::clone(&deps.monitor), deps.isolation),
            overrides: Arc::clone(&overrides),
            audit: Arc::clone(&deps.audit),
            config: deps.config.clone(),
            signals: deps.signals.clone(),
            observers: deps.observers,
        });
        Self {
            config: deps.config,
            registry: deps.registry,
            audit: deps.audit,
            monitor: deps.monitor,
            overrides,
            controller,
            signals: deps.signals,
        }
    }

    /// Open the production service from a validated configuration and
    /// record `system_startup`.
    ///
    /// # Errors
    ///
    /// Returns an error if state directories, the state database, the audit
    /// file, the probes, or the signal registry cannot be set up.
    pub async fn open(config: GovernanceConfig) -> anyhow::Result<Self> {
        let paths = config.paths.resolve();
        std::fs::create_dir_all(&paths.data_dir)
            .with_context(|| format!("failed to create {}", paths.data_dir.display()))?;
        std::fs::create_dir_all(&paths.bundles_dir)
            .with_context(|| format!("failed to create {}", paths.bundles_dir.display()))?;

        let store = BundleStore::open(&paths.state_db).await?;
        let audit = Arc::new(AuditLog::open(&paths.audit_log)?);
        let monitor = Arc::new(NetworkMonitor::from_config(&config.network)?);
        let signals = GovernanceSignals::new().context("failed to register governance signals")?;
        let live = LiveConfig::new(config);
        let registry = Arc::new(BundleRegistry::new(
            store,
            paths.bundles_dir.clone(),
            live.clone(),
            signals.clone(),
        ));

        let service = Self::new(ServiceDeps {
            isolation: Arc::new(SystemIsolationProbe::new(live.clone())),
            config: live,
            registry,
            audit,
            monitor,
            observers: ObserverSet::new(vec![Arc::new(LogObserver)]),
            signals,
        });
        service.record_startup();
        Ok(service)
    }

    /// Append `system_startup`. A degraded log is reported, not fatal: the
    /// controller refuses transitions until it is restored.
    pub fn record_startup(&self) {
        let record = AuditRecord::new(AuditEventType::SystemStartup, TriggeredBy::Operator, "service started")
            .modes(OperationMode::Online, OperationMode::Online)
            .metadata(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }));
        match self.audit.append(record) {
            Ok(_) => info!(version = env!("CARGO_PKG_VERSION"), "sovereign governance started"),
            Err(e) => error!(error = %e, "startup not recorded; transitions are refused until the audit log is restored"),
        }
    }

    // -----------------------------------------------------------------------
    // Status and mode
    // -----------------------------------------------------------------------

    /// Current status.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Storage`] if bundle counts cannot be read.
    pub async fn status(&self) -> Result<ServiceStatus, BundleError> {
        let snapshot = self.controller.snapshot().await;
        let counts = self.registry.count_by_status().await?;
        let count = |status: BundleStatus| counts.get(&status).copied().unwrap_or(0);
        let last_network_check = self.monitor.last_check();

        Ok(ServiceStatus {
            mode: snapshot.mode,
            online: last_network_check.as_ref().map(|c| c.is_online),
            active_bundle: snapshot.active_bundle,
            available_bundles: counts.values().fold(0u64, |acc, n| acc.saturating_add(*n)),
            validated_bundles: count(BundleStatus::Validated).saturating_add(count(BundleStatus::Loaded)),
            quarantined_bundles: count(BundleStatus::Quarantined),
            last_network_check,
            last_mode_change: snapshot.last_mode_change,
            last_reason: snapshot.last_reason,
            active_override: self.overrides.active(),
            audit_degraded: self.audit.degraded_reason(),
            config: self.config.snapshot(),
        })
    }

    /// Current mode state.
    pub async fn mode(&self) -> ModeSnapshot {
        self.controller.snapshot().await
    }

    /// Request a governed mode transition.
    ///
    /// # Errors
    ///
    /// Returns the [`Rejection`] with every reason; nothing changed.
    pub async fn transition(&self, request: TransitionRequest) -> Result<TransitionReport, Rejection> {
        self.controller.transition(request).await
    }

    // -----------------------------------------------------------------------
    // Bundles
    // -----------------------------------------------------------------------

    /// List bundles, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Storage`] on read failure.
    pub async fn list_bundles(&self, status: Option<BundleStatus>) -> Result<Vec<Bundle>, BundleError> {
        self.registry.list(status).await
    }

    /// Fetch one bundle.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::NotFound`] for an unknown id.
    pub async fn get_bundle(&self, id: &str) -> Result<Bundle, BundleError> {
        self.registry
            .get(id)
            .await?
            .ok_or_else(|| BundleError::NotFound(id.to_owned()))
    }

    /// Scan bundle storage for new bundles.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Timeout`] or [`BundleError::Storage`].
    pub async fn discover(&self) -> Result<DiscoveryReport, BundleError> {
        let report = match self.registry.discover().await {
            Ok(report) => report,
            Err(e) => {
                if e.is_transient() {
                    self.signals.transient_error("discovery");
                }
                warn!(error = %e, "bundle discovery failed");
                return Err(e);
            }
        };

        if self.config.snapshot().audit.log_discovery {
            let record = AuditRecord::new(AuditEventType::BundleDiscovery, TriggeredBy::Operator, "bundle discovery")
                .metadata(serde_json::json!({
                    "discovered": report.discovered,
                    "skipped": report.skipped,
                }));
            if let Err(e) = self.audit.append(record) {
                error!(error = %e, "failed to audit bundle discovery");
            }
        }
        info!(discovered = report.count(), skipped = report.skipped.len(), "bundle discovery finished");
        Ok(report)
    }

    /// Validate a bundle.
    ///
    /// A bundle that enters quarantine is audited and published. If the
    /// active bundle fails a re-validation, the service moves to QUARANTINE.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::NotFound`] or [`BundleError::Storage`].
    pub async fn validate(&self, id: &str, force: bool) -> Result<ValidationOutcome, BundleError> {
        let outcome = match self.registry.validate(id, force).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_transient() {
                    self.signals.transient_error("storage");
                }
                return Err(e);
            }
        };

        let ValidationOutcome::Checked {
            bundle,
            result,
            previous_status,
        } = &outcome
        else {
            return Ok(outcome);
        };

        if self.config.snapshot().audit.log_validations {
            let mut record = AuditRecord::new(AuditEventType::BundleValidation, TriggeredBy::Operator, "bundle validation")
                .bundle(Some(bundle.id.clone()))
                .metadata(serde_json::json!({
                    "forced": force,
                    "status_before": previous_status,
                    "status_after": bundle.status,
                    "hash_match": result.hash_match,
                    "warnings": result.warnings,
                }));
            if !result.is_valid {
                record = record.failed(result.errors.join("; "));
            }
            if let Err(e) = self.audit.append(record) {
                error!(error = %e, bundle_id = %bundle.id, "failed to audit bundle validation");
            }
        }

        if outcome.newly_quarantined() {
            self.controller.record_quarantine(
                &bundle.id,
                bundle.quarantine_reason.clone(),
                &result.errors,
                TriggeredBy::Operator,
            );
        }

        let lost_trust = *previous_status == BundleStatus::Loaded && !bundle.status.is_trusted();
        if lost_trust {
            let snapshot = self.controller.snapshot().await;
            if snapshot.mode.requires_bundle() && snapshot.active_bundle.as_deref() == Some(bundle.id.as_str()) {
                warn!(bundle_id = %bundle.id, "active bundle failed re-validation, entering quarantine");
                if let Err(rejection) = self
                    .controller
                    .transition(TransitionRequest::operator(
                        OperationMode::Quarantine,
                        REVALIDATION_QUARANTINE_REASON,
                    ))
                    .await
                {
                    error!(error = %rejection, "failed to enter quarantine after re-validation failure");
                    self.controller.detach_bundle(&bundle.id).await;
                }
            }
        }

        Ok(outcome)
    }

    /// Load a bundle under the transition lock.
    ///
    /// # Errors
    ///
    /// See [`ModeController::load_bundle`].
    pub async fn load_bundle(&self, id: &str, options: LoadOptions, reason: &str) -> Result<LoadOutcome, GovernanceError> {
        self.controller
            .load_bundle(id, options, TriggeredBy::Operator, reason)
            .await
    }

    /// Lift quarantine on a bundle (reset to pending).
    ///
    /// # Errors
    ///
    /// See [`ModeController::remove_quarantine`].
    pub async fn remove_quarantine(&self, id: &str, reason: &str) -> Result<Bundle, GovernanceError> {
        self.controller
            .remove_quarantine(id, TriggeredBy::Operator, reason)
            .await
    }

    // -----------------------------------------------------------------------
    // Network
    // -----------------------------------------------------------------------

    /// Run an on-demand connectivity check.
    pub async fn check_network(&self) -> NetworkCheckResult {
        let result = self.monitor.check().await;
        if !result.is_online {
            self.signals.transient_error("network_probe");
        }
        if self.config.snapshot().audit.log_network_checks {
            self.audit_network_check(&result, TriggeredBy::Operator, "on-demand network check");
        }
        result
    }

    /// One periodic check; falls back to OFFLINE on an online to offline
    /// edge while ONLINE when the policy asks for it.
    pub async fn network_tick(&self) -> NetworkTick {
        let observation = self.monitor.observe().await;
        let config = self.config.snapshot();

        if !observation.result.is_online {
            self.signals.transient_error("network_probe");
            warn!(
                error = observation.result.error.as_deref().unwrap_or_default(),
                "periodic connectivity check failed"
            );
        }
        if observation.changed() && config.audit.log_network_checks {
            self.audit_network_check(&observation.result, TriggeredBy::AutoNetworkMonitor, "connectivity changed");
        }

        let mut fallback = None;
        if config.network.auto_detect && config.fallback.fallback_to_offline && observation.went_offline() {
            let request = TransitionRequest {
                target: OperationMode::Offline,
                force: false,
                reason: FALLBACK_REASON.to_owned(),
                bundle_id: config.fallback.fallback_bundle_id.clone(),
                triggered_by: TriggeredBy::AutoNetworkMonitor,
                only_from: Some(OperationMode::Online),
            };
            let result = self.controller.transition(request).await;
            match &result {
                Ok(report) if report.changed => info!(
                    bundle_id = report.snapshot.active_bundle.as_deref().unwrap_or_default(),
                    "fell back to offline mode"
                ),
                Ok(_) => {}
                Err(rejection) => warn!(error = %rejection, "automatic offline fallback rejected"),
            }
            fallback = Some(result);
        }

        NetworkTick {
            observation,
            fallback,
        }
    }

    fn audit_network_check(&self, result: &NetworkCheckResult, triggered_by: TriggeredBy, reason: &str) {
        let mut record = AuditRecord::new(AuditEventType::NetworkCheck, triggered_by, reason).metadata(
            serde_json::json!({
                "is_online": result.is_online,
                "latency_ms": result.latency_ms,
                "method": result.method,
            }),
        );
        if let Some(err) = &result.error {
            record = record.failed(err.clone());
        }
        if let Err(e) = self.audit.append(record) {
            error!(error = %e, "failed to audit network check");
        }
    }

    /// Spawn the periodic connectivity loop.
    ///
    /// The interval is re-read from the live configuration on every tick.
    /// Exits when `shutdown_rx` flips to `true` or its sender is dropped.
    pub fn spawn_network_monitor(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            info!("network monitor started");
            loop {
                let interval = Duration::from_secs(service.config.snapshot().network.check_interval_secs);
                tokio::select! {
                    () = tokio::time::sleep(interval) => {
                        if service.config.snapshot().network.enabled {
                            service.network_tick().await;
                        }
                    }
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            info!("network monitor shutting down");
                            break;
                        }
                    }
                }
            }
            info!("network monitor stopped");
        })
    }

    // -----------------------------------------------------------------------
    // Config
    // -----------------------------------------------------------------------

    /// Live configuration.
    pub fn config(&self) -> GovernanceConfig {
        self.config.snapshot()
    }

    /// Validate and apply a config patch.
    ///
    /// # Errors
    ///
    /// See [`ModeController::update_config`].
    pub async fn update_config(&self, patch: &ConfigPatch, reason: &str) -> Result<GovernanceConfig, GovernanceError> {
        self.controller
            .update_config(patch, TriggeredBy::Operator, reason)
            .await
    }

    // -----------------------------------------------------------------------
    // Overrides
    // -----------------------------------------------------------------------

    /// Start a time-boxed override.
    ///
    /// # Errors
    ///
    /// See [`OverrideError`].
    pub fn begin_override(&self, reason: &str, ttl: Duration) -> Result<OverrideState, OverrideError> {
        self.overrides.begin_override(reason, ttl)
    }

    /// End the active override.
    ///
    /// # Errors
    ///
    /// Returns [`OverrideError::NotActive`] when none is active.
    pub fn end_override(&self, reason: &str) -> Result<OverrideState, OverrideError> {
        self.overrides.end_override(reason)
    }

    /// The active override, if any.
    pub fn active_override(&self) -> Option<OverrideState> {
        self.overrides.active()
    }

    /// Override governor, for callers that need an explicit clock.
    pub fn overrides(&self) -> &OverrideGovernor {
        &self.overrides
    }

    // -----------------------------------------------------------------------
    // Audit and statistics
    // -----------------------------------------------------------------------

    /// Page through the audit log, newest first.
    pub fn audit_entries(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        self.audit.query(query)
    }

    /// Verify the in-memory chain. Returns the number of entries checked.
    ///
    /// # Errors
    ///
    /// Returns the first [`ChainBreak`].
    pub fn verify_audit(&self) -> Result<usize, ChainBreak> {
        self.audit.verify()
    }

    /// Reopen the audit sink and clear the degraded state.
    ///
    /// # Errors
    ///
    /// See [`AuditLog::restore`].
    pub fn restore_audit(&self, reason: &str) -> Result<AuditEntry, AuditError> {
        self.audit.restore(TriggeredBy::Operator, reason)
    }

    /// Aggregate counters.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Storage`] if bundle counts cannot be read.
    pub async fn statistics(&self) -> Result<Statistics, BundleError> {
        Ok(Statistics {
            bundles_by_status: self.registry.count_by_status().await?,
            mode_switches: self.controller.switch_counts(),
            audit_events: self.audit.count_by_type(),
            audit_entries: self.audit.len(),
        })
    }

    /// Exported signals.
    pub fn signals(&self) -> &GovernanceSignals {
        &self.signals
    }
}
