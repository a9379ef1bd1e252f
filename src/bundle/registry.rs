//! Bundle lifecycle owner.
//!
//! Discovers bundles on storage, applies validation verdicts to bundle
//! status, and performs the atomic demote/promote pair on load. Validation
//! of the same id is serialized through a per-id async lock; different ids
//! validate concurrently. Load ordering across ids is the caller's job
//! (the mode controller holds the transition lock around every load).

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::store::{BundleStore, Promotion};
use super::validator::{read_manifest_bytes, sha256_bytes, BundleValidator};
use super::{Bundle, BundleError, BundleManifest, ValidationResult, MANIFEST_FILE};
use crate::config::LiveConfig;
use crate::signals::GovernanceSignals;
use crate::types::BundleStatus;

/// Upper bound for one discovery scan.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(120);

const VERDICT_WRITE_ATTEMPTS: u32 = 3;

/// Options for [`BundleRegistry::load`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadOptions {
    /// Re-run validation even if the bundle is already validated.
    pub force_revalidate: bool,
    /// Report a quarantined bundle as a load rejection instead of a
    /// quarantine violation. Quarantine itself is never bypassed.
    pub skip_quarantine_check: bool,
}

/// Result of a successful load.
#[derive(Debug, Clone, Serialize)]
pub struct LoadOutcome {
    /// The bundle after the load.
    pub bundle: Bundle,
    /// Bundle that was loaded before and is now validated again.
    pub demoted: Option<String>,
    /// Validation run as part of the load, if any.
    pub validation: Option<ValidationResult>,
    /// The bundle was already loaded; nothing changed.
    pub already_loaded: bool,
}

/// Result of [`BundleRegistry::validate`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ValidationOutcome {
    /// Already trusted and not forced; validator not invoked.
    Skipped {
        /// Current bundle state.
        bundle: Bundle,
    },
    /// Validator ran and the verdict was applied.
    Checked {
        /// Bundle after the verdict.
        bundle: Bundle,
        /// Verdict.
        result: ValidationResult,
        /// Status before the verdict.
        previous_status: BundleStatus,
    },
}

impl ValidationOutcome {
    /// Bundle state after the call.
    pub fn bundle(&self) -> &Bundle {
        match self {
            Self::Skipped { bundle } | Self::Checked { bundle, .. } => bundle,
        }
    }

    /// Validation result, if the validator ran.
    pub fn result(&self) -> Option<&ValidationResult> {
        match self {
            Self::Skipped { .. } => None,
            Self::Checked { result, .. } => Some(result),
        }
    }

    /// Whether this call moved the bundle into quarantine.
    pub fn newly_quarantined(&self) -> bool {
        match self {
            Self::Skipped { .. } => false,
            Self::Checked {
                bundle,
                previous_status,
                ..
            } => bundle.status == BundleStatus::Quarantined && *previous_status != BundleStatus::Quarantined,
        }
    }
}

/// A directory discovery could not register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedBundle {
    /// Directory name.
    pub id: String,
    /// Why it was skipped.
    pub reason: String,
}

/// Outcome of one discovery scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    /// Newly registered bundle ids.
    pub discovered: Vec<String>,
    /// Directories with unusable manifests.
    pub skipped: Vec<SkippedBundle>,
}

impl DiscoveryReport {
    /// Number of newly registered bundles.
    pub fn count(&self) -> usize {
        self.discovered.len()
    }
}

/// Bundle registry.
pub struct BundleRegistry {
    store: BundleStore,
    bundles_dir: PathBuf,
    config: LiveConfig,
    signals: GovernanceSignals,
    validation_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl BundleRegistry {
    /// Create a registry over `store`, scanning `bundles_dir` on discovery.
    pub fn new(
        store: BundleStore,
        bundles_dir: PathBuf,
        config: LiveConfig,
        signals: GovernanceSignals,
    ) -> Self {
        Self {
            store,
            bundles_dir,
            config,
            signals,
            validation_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Bundle storage root.
    pub fn bundles_dir(&self) -> &Path {
        &self.bundles_dir
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Fetch one bundle.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Storage`] on read failure.
    pub async fn get(&self, id: &str) -> Result<Option<Bundle>, BundleError> {
        self.store.get(id).await
    }

    /// List bundles, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Storage`] on read failure.
    pub async fn list(&self, status: Option<BundleStatus>) -> Result<Vec<Bundle>, BundleError> {
        self.store.list(status).await
    }

    /// Counts per status.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Storage`] on read failure.
    pub async fn count_by_status(&self) -> Result<BTreeMap<BundleStatus, u64>, BundleError> {
        self.store.count_by_status().await
    }

    /// The loaded bundle, if any.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Storage`] on read failure.
    pub async fn loaded(&self) -> Result<Option<Bundle>, BundleError> {
        self.store.loaded().await
    }

    async fn require(&self, id: &str) -> Result<Bundle, BundleError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| BundleError::NotFound(id.to_owned()))
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Scan bundle storage and register new bundles as pending.
    ///
    /// Existing rows are never touched. A missing storage directory yields an
    /// empty report.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Timeout`] if the scan exceeds
    /// [`DISCOVERY_TIMEOUT`], or [`BundleError::Storage`] on I/O failure.
    pub async fn discover(&self) -> Result<DiscoveryReport, BundleError> {
        tokio::time::timeout(DISCOVERY_TIMEOUT, self.scan())
            .await
            .map_err(|_| BundleError::Timeout(DISCOVERY_TIMEOUT.as_secs()))?
    }

    async fn scan(&self) -> Result<DiscoveryReport, BundleError> {
        let mut report = DiscoveryReport::default();
        let mut entries = match tokio::fs::read_dir(&self.bundles_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %self.bundles_dir.display(), "bundle storage does not exist yet");
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        };

        let known = self.store.ids().await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_valid_bundle_id(&name) {
                warn!(dir = %name, "skipping bundle directory with unsupported name");
                report.skipped.push(SkippedBundle {
                    id: name,
                    reason: "directory name is not a valid bundle id".to_owned(),
                });
                continue;
            }
            if known.contains(&name) {
                continue;
            }

            match read_bundle(&name, &entry.path()).await {
                Ok(bundle) => {
                    if self.store.insert_if_absent(&bundle).await? {
                        info!(bundle_id = %bundle.id, version = %bundle.version, "bundle discovered");
                        report.discovered.push(name);
                    }
                }
                Err(reason) => {
                    warn!(bundle_id = %name, reason = %reason, "skipping bundle with unusable manifest");
                    report.skipped.push(SkippedBundle { id: name, reason });
                }
            }
        }

        report.discovered.sort();
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Validate a bundle and apply the verdict to its status.
    ///
    /// Validated and loaded bundles are skipped unless `force` is set. A
    /// quarantined bundle stays quarantined whatever the verdict.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::NotFound`] for an unknown id or
    /// [`BundleError::Storage`] if the verdict cannot be persisted.
    pub async fn validate(&self, id: &str, force: bool) -> Result<ValidationOutcome, BundleError> {
        let lock = self.validation_lock(id);
        let _guard = lock.lock().await;

        let bundle = self.require(id).await?;
        if !force && bundle.status.is_trusted() {
            debug!(bundle_id = %id, status = %bundle.status, "validation skipped");
            return Ok(ValidationOutcome::Skipped { bundle });
        }
        self.validate_locked(bundle).await
    }

    /// Caller must hold the per-id validation lock.
    ///
    /// Loads and unloads of other ids may demote or promote this bundle
    /// while it is being hashed, so the verdict is written only against the
    /// status it was applied to and re-applied to a fresh read otherwise.
    async fn validate_locked(&self, bundle: Bundle) -> Result<ValidationOutcome, BundleError> {
        let policy = self.config.snapshot().trust;
        let result = BundleValidator::new(policy.clone()).validate(&bundle).await;

        let mut current = bundle;
        let mut attempts: u32 = 0;
        let (previous_status, updated) = loop {
            let previous_status = current.status;
            let mut updated = current.clone();
            apply_verdict(&mut updated, &result, policy.quarantine_on_failure);
            if self.store.update_lifecycle_from(&updated, previous_status).await? {
                break (previous_status, updated);
            }
            attempts = attempts.saturating_add(1);
            if attempts >= VERDICT_WRITE_ATTEMPTS {
                return Err(BundleError::Storage(format!(
                    "bundle {} kept changing status while its verdict was written",
                    updated.id
                )));
            }
            current = self.require(&updated.id).await?;
            debug!(
                bundle_id = %current.id,
                from = %previous_status,
                to = %current.status,
                "bundle status moved during validation, re-applying verdict"
            );
        };

        if result.has_signature_error() {
            self.signals.bundle_signature_failure();
        }

        match (previous_status, updated.status) {
            (BundleStatus::Quarantined, BundleStatus::Quarantined) if result.is_valid => {
                warn!(
                    bundle_id = %updated.id,
                    "bundle passes validation but stays quarantined until quarantine is removed"
                );
            }
            (before, BundleStatus::Quarantined) if before != BundleStatus::Quarantined => {
                self.signals.bundle_quarantined();
                warn!(
                    bundle_id = %updated.id,
                    reason = updated.quarantine_reason.as_deref().unwrap_or_default(),
                    "bundle quarantined"
                );
            }
            (_, after) => {
                info!(
                    bundle_id = %updated.id,
                    from = %previous_status,
                    to = %after,
                    is_valid = result.is_valid,
                    errors = result.errors.len(),
                    warnings = result.warnings.len(),
                    "bundle validated"
                );
            }
        }

        Ok(ValidationOutcome::Checked {
            bundle: updated,
            result,
            previous_status,
        })
    }

    fn validation_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.validation_locks.lock().unwrap_or_else(|poisoned| {
            warn!("validation lock table poisoned, recovering");
            PoisonError::into_inner(poisoned)
        });
        Arc::clone(locks.entry(id.to_owned()).or_default())
    }

    // -----------------------------------------------------------------------
    // Load / unload
    // -----------------------------------------------------------------------

    /// Load a bundle, demoting whichever bundle was loaded before.
    ///
    /// Pending bundles (and every bundle under `force_revalidate`) are
    /// validated first. Only a validated bundle is promoted.
    ///
    /// # Errors
    ///
    /// - [`BundleError::BundleQuarantined`] if quarantined and the check is not skipped.
    /// - [`BundleError::LoadRejected`] if the bundle is not validated after
    ///   the optional validation pass.
    /// - [`BundleError::NotFound`] / [`BundleError::Storage`] otherwise.
    pub async fn load(&self, id: &str, options: LoadOptions) -> Result<LoadOutcome, BundleError> {
        let lock = self.validation_lock(id);
        let _guard = lock.lock().await;

        let mut bundle = self.require(id).await?;

        if bundle.status == BundleStatus::Quarantined {
            if !options.skip_quarantine_check {
                return Err(BundleError::BundleQuarantined {
                    id: bundle.id,
                    reason: bundle.quarantine_reason,
                });
            }
            return Err(BundleError::LoadRejected {
                id: bundle.id,
                status: BundleStatus::Quarantined,
                reasons: vec!["bundle is quarantined; remove the quarantine and re-validate".to_owned()],
                quarantined: false,
            });
        }

        let mut validation = None;
        let mut quarantined = false;
        if bundle.status == BundleStatus::Pending || options.force_revalidate {
            let outcome = self.validate_locked(bundle).await?;
            quarantined = outcome.newly_quarantined();
            if let ValidationOutcome::Checked {
                bundle: checked,
                result,
                ..
            } = outcome
            {
                bundle = checked;
                validation = Some(result);
            } else {
                bundle = outcome.bundle().clone();
            }
        }

        match bundle.status {
            BundleStatus::Loaded => {
                return Ok(LoadOutcome {
                    bundle,
                    demoted: None,
                    validation,
                    already_loaded: true,
                });
            }
            BundleStatus::Validated => {}
            BundleStatus::Pending | BundleStatus::Quarantined | BundleStatus::Failed => {
                let reasons = match &validation {
                    Some(result) if !result.errors.is_empty() => result.errors.clone(),
                    _ => vec![format!("bundle status is {}; it must be validated first", bundle.status)],
                };
                warn!(bundle_id = %bundle.id, status = %bundle.status, "bundle load rejected");
                return Err(BundleError::LoadRejected {
                    id: bundle.id,
                    status: bundle.status,
                    reasons,
                    quarantined,
                });
            }
        }

        match self.store.promote(id, Utc::now()).await? {
            Promotion::Promoted { demoted } => {
                let bundle = self.require(id).await?;
                info!(
                    bundle_id = %bundle.id,
                    demoted = demoted.as_deref().unwrap_or_default(),
                    load_count = bundle.load_count,
                    "bundle loaded"
                );
                Ok(LoadOutcome {
                    bundle,
                    demoted,
                    validation,
                    already_loaded: false,
                })
            }
            Promotion::NotValidated => {
                let current = self.require(id).await?;
                Err(BundleError::LoadRejected {
                    id: current.id,
                    status: current.status,
                    reasons: vec!["bundle status changed before promotion".to_owned()],
                    quarantined: false,
                })
            }
        }
    }

    /// Demote a loaded bundle back to validated. Returns whether it was loaded.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Storage`] on write failure.
    pub async fn unload(&self, id: &str) -> Result<bool, BundleError> {
        let changed = self.store.demote(id).await?;
        if changed {
            info!(bundle_id = %id, "bundle unloaded");
        }
        Ok(changed)
    }

    /// Undo a load or unload whose audit record could not be written.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Storage`] on write failure.
    pub async fn reinstate(
        &self,
        previous: Option<&str>,
        current: Option<&str>,
    ) -> Result<(), BundleError> {
        self.store.reinstate(previous, current).await
    }

    /// Put a bundle back to a prior lifecycle snapshot (used on rollback).
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Storage`] on write failure.
    pub async fn restore_lifecycle(&self, snapshot: &Bundle) -> Result<(), BundleError> {
        self.store.update_lifecycle(snapshot).await
    }

    /// Clear quarantine and reset the bundle to pending.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::NotQuarantined`] if the bundle is not
    /// quarantined, [`BundleError::NotFound`] for an unknown id.
    pub async fn remove_quarantine(&self, id: &str) -> Result<Bundle, BundleError> {
        let lock = self.validation_lock(id);
        let _guard = lock.lock().await;

        let mut bundle = self.require(id).await?;
        if bundle.status != BundleStatus::Quarantined {
            return Err(BundleError::NotQuarantined {
                id: bundle.id,
                status: bundle.status,
            });
        }

        bundle.status = BundleStatus::Pending;
        bundle.quarantine_reason = None;
        bundle.quarantined_at = None;
        self.store.update_lifecycle(&bundle).await?;
        info!(bundle_id = %id, "quarantine removed, bundle reset to pending");
        Ok(bundle)
    }
}

/// Apply a validation verdict to a bundle's lifecycle fields.
///
/// Quarantine is sticky: only [`BundleRegistry::remove_quarantine`] lifts it.
pub fn apply_verdict(bundle: &mut Bundle, result: &ValidationResult, quarantine_on_failure: bool) {
    match (bundle.status, result.is_valid) {
        (BundleStatus::Quarantined, _) => {}
        (BundleStatus::Loaded, true) => {
            bundle.last_validated = Some(result.validated_at);
        }
        (BundleStatus::Pending | BundleStatus::Validated | BundleStatus::Failed, true) => {
            bundle.status = BundleStatus::Validated;
            bundle.last_validated = Some(result.validated_at);
        }
        (_, false) => {
            if quarantine_on_failure {
                bundle.status = BundleStatus::Quarantined;
                bundle.quarantine_reason = Some(result.errors.join("; "));
                bundle.quarantined_at = Some(result.validated_at);
            } else {
                bundle.status = BundleStatus::Failed;
            }
        }
    }
}

/// Bundle ids are directory names restricted to `[A-Za-z0-9._-]`, not
/// starting with a dot.
pub fn is_valid_bundle_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Build a pending bundle from a storage directory.
async fn read_bundle(id: &str, dir: &Path) -> Result<Bundle, String> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let bytes = read_manifest_bytes(&manifest_path)
        .await
        .map_err(|e| format!("manifest unreadable: {e}"))?;
    let manifest: BundleManifest =
        serde_json::from_slice(&bytes).map_err(|e| format!("manifest parse failure: {e}"))?;

    let artifact = Path::new(&manifest.artifact);
    let contained = artifact
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !contained || manifest.artifact.is_empty() {
        return Err(format!(
            "artifact path {} escapes the bundle directory",
            manifest.artifact
        ));
    }

    Ok(Bundle {
        id: id.to_owned(),
        name: manifest.name,
        version: manifest.version,
        model_type: manifest.model_type,
        model_size: manifest.model_size,
        artifact_path: dir.join(artifact),
        manifest_path,
        artifact_digest: manifest.artifact_sha256.trim().to_ascii_lowercase(),
        manifest_digest: sha256_bytes(&bytes),
        signer: manifest.signer,
        capabilities: manifest.capabilities,
        requirements: manifest.requirements,
        status: BundleStatus::Pending,
        discovered_at: Utc::now(),
        last_validated: None,
        last_loaded: None,
        load_count: 0,
        quarantine_reason: None,
        quarantined_at: None,
    })
}
