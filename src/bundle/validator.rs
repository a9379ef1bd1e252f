//! Bundle trust verification.
//!
//! Recomputes the artifact digest by streaming the file in bounded chunks,
//! re-reads and re-hashes the manifest, and applies the signer policy. Every
//! problem lands in `errors`/`warnings`; nothing here returns `Err` or
//! mutates the bundle.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use super::{Bundle, BundleManifest, ValidationResult, MAX_MANIFEST_BYTES};
use crate::config::TrustConfig;

/// Prefix of every error produced by the signer policy.
pub const SIGNATURE_ERROR_PREFIX: &str = "signature:";

/// Stateless validator configured with a trust policy snapshot.
#[derive(Debug, Clone)]
pub struct BundleValidator {
    policy: TrustConfig,
}

impl BundleValidator {
    /// Create a validator for the given trust policy.
    pub fn new(policy: TrustConfig) -> Self {
        Self { policy }
    }

    /// Validate a bundle against its recorded trust material.
    ///
    /// Bounded by `trust.validation_timeout_secs`; a timeout is reported as
    /// an error in the result.
    pub async fn validate(&self, bundle: &Bundle) -> ValidationResult {
        let limit = Duration::from_secs(self.policy.validation_timeout_secs);
        match tokio::time::timeout(limit, self.run_checks(bundle)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    bundle_id = %bundle.id,
                    timeout_secs = self.policy.validation_timeout_secs,
                    "bundle validation timed out"
                );
                ValidationResult {
                    is_valid: false,
                    hash_match: false,
                    file_exists: false,
                    manifest_valid: false,
                    errors: vec![format!(
                        "validation timed out after {}s",
                        self.policy.validation_timeout_secs
                    )],
                    warnings: Vec::new(),
                    validated_at: Utc::now(),
                }
            }
        }
    }

    async fn run_checks(&self, bundle: &Bundle) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let (file_exists, hash_match) = self.check_artifact(bundle, &mut errors, &mut warnings).await;
        let manifest_valid = check_manifest(bundle, &mut errors).await;
        self.check_signer(bundle, &mut errors, &mut warnings);

        debug!(
            bundle_id = %bundle.id,
            file_exists,
            hash_match,
            manifest_valid,
            errors = errors.len(),
            "bundle checks finished"
        );

        ValidationResult {
            is_valid: errors.is_empty(),
            hash_match,
            file_exists,
            manifest_valid,
            errors,
            warnings,
            validated_at: Utc::now(),
        }
    }

    /// Returns `(file_exists, hash_match)`.
    async fn check_artifact(
        &self,
        bundle: &Bundle,
        errors: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) -> (bool, bool) {
        let path = &bundle.artifact_path;
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(e) => {
                errors.push(format!("artifact missing: {} ({e})", path.display()));
                return (false, false);
            }
        };
        if !meta.is_file() {
            errors.push(format!("artifact is not a regular file: {}", path.display()));
            return (false, false);
        }
        if meta.len() == 0 {
            warnings.push("artifact is empty".to_owned());
        }

        match sha256_file_streaming(path, self.policy.chunk_size_bytes).await {
            Ok(actual) => {
                let matched = digests_equal(&actual, &bundle.artifact_digest);
                if !matched {
                    errors.push(format!(
                        "artifact digest mismatch: expected {}, found {actual}",
                        bundle.artifact_digest
                    ));
                }
                (true, matched)
            }
            Err(e) => {
                errors.push(format!("artifact unreadable: {} ({e})", path.display()));
                (true, false)
            }
        }
    }

    fn check_signer(&self, bundle: &Bundle, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
        if bundle.is_signed() {
            return;
        }
        if self.policy.strict_validation && !self.policy.allow_unsigned_bundles {
            errors.push(format!(
                "{SIGNATURE_ERROR_PREFIX} bundle has no signer identity and unsigned bundles are not allowed"
            ));
        } else {
            warnings.push("bundle has no signer identity".to_owned());
        }
    }
}

/// Re-hash and re-parse the manifest. Returns `manifest_valid`.
async fn check_manifest(bundle: &Bundle, errors: &mut Vec<String>) -> bool {
    let path = &bundle.manifest_path;
    let bytes = match read_manifest_bytes(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            errors.push(format!("manifest unreadable: {} ({e})", path.display()));
            return false;
        }
    };

    let mut valid = true;
    let actual = sha256_bytes(&bytes);
    if !digests_equal(&actual, &bundle.manifest_digest) {
        errors.push(format!(
            "manifest digest mismatch: expected {}, found {actual}",
            bundle.manifest_digest
        ));
        valid = false;
    }

    match serde_json::from_slice::<BundleManifest>(&bytes) {
        Ok(manifest) => {
            if !digests_equal(&manifest.artifact_sha256, &bundle.artifact_digest) {
                errors.push(format!(
                    "manifest declares artifact digest {} but {} is recorded",
                    manifest.artifact_sha256, bundle.artifact_digest
                ));
                valid = false;
            }
            if manifest.signer != bundle.signer {
                errors.push(format!(
                    "{SIGNATURE_ERROR_PREFIX} manifest signer does not match recorded signer"
                ));
                valid = false;
            }
        }
        Err(e) => {
            errors.push(format!("manifest parse failure: {e}"));
            valid = false;
        }
    }

    valid
}

/// Read a manifest, refusing anything over [`MAX_MANIFEST_BYTES`].
///
/// # Errors
///
/// Returns an error if the file is missing, too large, or unreadable.
pub async fn read_manifest_bytes(path: &Path) -> std::io::Result<Vec<u8>> {
    let meta = tokio::fs::metadata(path).await?;
    if meta.len() > MAX_MANIFEST_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("manifest exceeds {MAX_MANIFEST_BYTES} bytes"),
        ));
    }
    tokio::fs::read(path).await
}

/// Compute the SHA-256 hex digest of a byte slice.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute the SHA-256 hex digest of a file, reading `chunk_size` bytes at a time.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub async fn sha256_file_streaming(path: &Path, chunk_size: usize) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0_u8; chunk_size.max(1)];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(buf.get(..n).unwrap_or_default());
    }
    Ok(hex::encode(hasher.finalize()))
}

fn digests_equal(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}
