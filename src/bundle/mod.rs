//! Offline model bundles: data model, validation, persistence, and lifecycle.
//!
//! A bundle is a directory under the bundle storage root containing a
//! `manifest.json` and the artifact it describes. The directory name is the
//! bundle id. Trust material (digests, signer) is captured from the manifest
//! at discovery and re-checked against disk on every validation.

pub mod registry;
pub mod store;
pub mod validator;

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::BundleStatus;

/// File name of the manifest inside a bundle directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Manifests larger than this are rejected without parsing.
pub const MAX_MANIFEST_BYTES: u64 = 1_048_576;

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// On-disk bundle manifest (consumed, never produced, by the engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleManifest {
    /// Human-readable bundle name.
    pub name: String,
    /// Bundle version string.
    pub version: String,
    /// Model family (e.g. "llm", "embedding").
    pub model_type: String,
    /// Size class (e.g. "7b").
    pub model_size: String,
    /// Artifact file name relative to the bundle directory.
    #[serde(default = "default_artifact_name")]
    pub artifact: String,
    /// Expected SHA-256 of the artifact, hex encoded.
    pub artifact_sha256: String,
    /// Declared capabilities.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Declared runtime requirements.
    #[serde(default)]
    pub requirements: BTreeMap<String, serde_json::Value>,
    /// Signer identity, if the bundle is signed.
    #[serde(default)]
    pub signer: Option<String>,
}

fn default_artifact_name() -> String {
    "model.bin".to_owned()
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// A registered bundle and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bundle {
    /// Stable id (bundle directory name).
    pub id: String,
    /// Name from the manifest.
    pub name: String,
    /// Version from the manifest.
    pub version: String,
    /// Model family.
    pub model_type: String,
    /// Size class.
    pub model_size: String,
    /// Absolute artifact location.
    pub artifact_path: PathBuf,
    /// Absolute manifest location.
    pub manifest_path: PathBuf,
    /// Recorded artifact SHA-256 (hex).
    pub artifact_digest: String,
    /// Recorded manifest SHA-256 (hex), captured at discovery.
    pub manifest_digest: String,
    /// Signer identity, if any.
    pub signer: Option<String>,
    /// Declared capabilities.
    pub capabilities: Vec<String>,
    /// Declared requirements.
    pub requirements: BTreeMap<String, serde_json::Value>,
    /// Lifecycle status.
    pub status: BundleStatus,
    /// When discovery registered the bundle.
    pub discovered_at: DateTime<Utc>,
    /// Last successful validation.
    pub last_validated: Option<DateTime<Utc>>,
    /// Last promotion to loaded.
    pub last_loaded: Option<DateTime<Utc>>,
    /// Number of times the bundle was loaded.
    pub load_count: u64,
    /// Why the bundle was quarantined.
    pub quarantine_reason: Option<String>,
    /// When the bundle was quarantined.
    pub quarantined_at: Option<DateTime<Utc>>,
}

impl Bundle {
    /// Whether the bundle carries a signer identity.
    pub fn is_signed(&self) -> bool {
        self.signer.as_deref().is_some_and(|s| !s.trim().is_empty())
    }
}

// ---------------------------------------------------------------------------
// ValidationResult
// ---------------------------------------------------------------------------

/// Outcome of one validation pass. Produced fresh on every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// No errors were recorded.
    pub is_valid: bool,
    /// Artifact digest matched the recorded digest.
    pub hash_match: bool,
    /// Artifact file was present.
    pub file_exists: bool,
    /// Manifest was present, unchanged, and parseable.
    pub manifest_valid: bool,
    /// Blocking problems.
    pub errors: Vec<String>,
    /// Non-blocking observations.
    pub warnings: Vec<String>,
    /// When the pass finished.
    pub validated_at: DateTime<Utc>,
}

impl ValidationResult {
    /// Whether any error concerns the signature requirement.
    pub fn has_signature_error(&self) -> bool {
        self.errors
            .iter()
            .any(|e| e.starts_with(validator::SIGNATURE_ERROR_PREFIX))
    }

    /// Same verdict ignoring the timestamp.
    pub fn same_verdict(&self, other: &ValidationResult) -> bool {
        self.is_valid == other.is_valid
            && self.hash_match == other.hash_match
            && self.file_exists == other.file_exists
            && self.manifest_valid == other.manifest_valid
            && self.errors == other.errors
            && self.warnings == other.warnings
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Bundle registry errors.
#[derive(Debug, Error)]
pub enum BundleError {
    /// No bundle with this id.
    #[error("bundle not found: {0}")]
    NotFound(String),

    /// Load attempted on a quarantined bundle without the explicit bypass.
    #[error("bundle {id} is quarantined: {}", .reason.as_deref().unwrap_or("no reason recorded"))]
    BundleQuarantined {
        /// Bundle id.
        id: String,
        /// Recorded quarantine reason.
        reason: Option<String>,
    },

    /// Bundle is not in a loadable state.
    #[error("load rejected for bundle {id} (status {status}): {}", .reasons.join("; "))]
    LoadRejected {
        /// Bundle id.
        id: String,
        /// Status at the time of rejection.
        status: BundleStatus,
        /// Every reason the load was refused.
        reasons: Vec<String>,
        /// The load's own validation pass moved the bundle into quarantine.
        quarantined: bool,
    },

    /// `remove_quarantine` on a bundle that is not quarantined.
    #[error("bundle {id} is not quarantined (status {status})")]
    NotQuarantined {
        /// Bundle id.
        id: String,
        /// Current status.
        status: BundleStatus,
    },

    /// Storage or filesystem failure; safe to retry.
    #[error("bundle storage error: {0}")]
    Storage(String),

    /// A storage scan exceeded its time bound.
    #[error("bundle storage timed out after {0}s")]
    Timeout(u64),
}

impl From<sqlx::Error> for BundleError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<std::io::Error> for BundleError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl BundleError {
    /// Whether the error is a governance violation rather than a fault.
    pub fn is_governance_violation(&self) -> bool {
        matches!(self, Self::BundleQuarantined { .. } | Self::NotQuarantined { .. })
    }

    /// Whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Timeout(_))
    }
}
