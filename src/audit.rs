//! Hash-chained, append-only audit log of governance decisions.
//!
//! One JSON entry per line. Each entry stores the SHA-256 of the canonical
//! serialization (compact `serde_json`) of its predecessor in `prev_hash`;
//! the first entry links to [`GENESIS_HASH`]. Appends are serialized under
//! one lock. A write failure degrades the log: every further append fails
//! until [`AuditLog::restore`] succeeds, which keeps the engine fail closed.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bundle::validator::sha256_bytes;
use crate::types::{OperationMode, ParseLabelError, TriggeredBy};

/// `prev_hash` of the first entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Audit event type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A mode transition attempt (committed, rejected, or no-op).
    ModeChange,
    /// A discovery scan.
    BundleDiscovery,
    /// A bundle validation.
    BundleValidation,
    /// A bundle load attempt.
    BundleLoad,
    /// Quarantine cleared by an operator.
    QuarantineRemoved,
    /// A bundle entered quarantine.
    BundleQuarantined,
    /// An override was requested.
    OverrideBegin,
    /// An override was ended explicitly.
    OverrideEnd,
    /// An override lapsed at its expiry.
    OverrideExpired,
    /// A network check that changed the online flag.
    NetworkCheck,
    /// A configuration patch.
    ConfigChange,
    /// The audit path was restored after a failure.
    AuditRestored,
    /// The engine started.
    SystemStartup,
}

impl AuditEventType {
    /// All event types.
    pub const ALL: [AuditEventType; 13] = [
        Self::ModeChange,
        Self::BundleDiscovery,
        Self::BundleValidation,
        Self::BundleLoad,
        Self::QuarantineRemoved,
        Self::BundleQuarantined,
        Self::OverrideBegin,
        Self::OverrideEnd,
        Self::OverrideExpired,
        Self::NetworkCheck,
        Self::ConfigChange,
        Self::AuditRestored,
        Self::SystemStartup,
    ];

    /// Stable snake_case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModeChange => "mode_change",
            Self::BundleDiscovery => "bundle_discovery",
            Self::BundleValidation => "bundle_validation",
            Self::BundleLoad => "bundle_load",
            Self::QuarantineRemoved => "quarantine_removed",
            Self::BundleQuarantined => "bundle_quarantined",
            Self::OverrideBegin => "override_begin",
            Self::OverrideEnd => "override_end",
            Self::OverrideExpired => "override_expired",
            Self::NetworkCheck => "network_check",
            Self::ConfigChange => "config_change",
            Self::AuditRestored => "audit_restored",
            Self::SystemStartup => "system_startup",
        }
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditEventType {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or(ParseLabelError {
                kind: "audit event type",
                value: wanted,
            })
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// One sealed audit entry. Field order defines the canonical serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique entry id (UUID v4).
    pub id: String,
    /// When the entry was appended.
    pub timestamp: DateTime<Utc>,
    /// Event discriminator.
    pub event_type: AuditEventType,
    /// Mode before the decision.
    pub mode_before: Option<OperationMode>,
    /// Mode after the decision.
    pub mode_after: Option<OperationMode>,
    /// Bundle concerned, if any.
    pub bundle_id: Option<String>,
    /// Operator- or system-supplied reason.
    pub reason: String,
    /// Originator.
    pub triggered_by: TriggeredBy,
    /// Whether the governed action succeeded.
    pub success: bool,
    /// Failure description when `success` is false.
    pub error: Option<String>,
    /// Event-specific details.
    pub metadata: serde_json::Value,
    /// Digest of the previous entry.
    pub prev_hash: String,
}

/// Unsealed entry content; [`AuditLog::append`] adds id, timestamp, and link.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    /// Event discriminator.
    pub event_type: AuditEventType,
    /// Mode before.
    pub mode_before: Option<OperationMode>,
    /// Mode after.
    pub mode_after: Option<OperationMode>,
    /// Bundle concerned.
    pub bundle_id: Option<String>,
    /// Reason.
    pub reason: String,
    /// Originator.
    pub triggered_by: TriggeredBy,
    /// Outcome.
    pub success: bool,
    /// Failure description.
    pub error: Option<String>,
    /// Details.
    pub metadata: serde_json::Value,
}

impl AuditRecord {
    /// A successful record with empty metadata.
    pub fn new(event_type: AuditEventType, triggered_by: TriggeredBy, reason: impl Into<String>) -> Self {
        Self {
            event_type,
            mode_before: None,
            mode_after: None,
            bundle_id: None,
            reason: reason.into(),
            triggered_by,
            success: true,
            error: None,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Set `mode_before`/`mode_after`.
    #[must_use]
    pub fn modes(mut self, before: OperationMode, after: OperationMode) -> Self {
        self.mode_before = Some(before);
        self.mode_after = Some(after);
        self
    }

    /// Set the bundle id.
    #[must_use]
    pub fn bundle(mut self, bundle_id: Option<String>) -> Self {
        self.bundle_id = bundle_id;
        self
    }

    /// Mark as failed.
    #[must_use]
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }

    /// Attach metadata.
    #[must_use]
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

// ---------------------------------------------------------------------------
// Chain verification
// ---------------------------------------------------------------------------

/// First position where the chain does not hold.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("audit chain broken at entry {index}: expected prev_hash {expected}, found {found}")]
pub struct ChainBreak {
    /// Index of the first entry whose link does not match.
    pub index: usize,
    /// Recomputed digest of the predecessor.
    pub expected: String,
    /// Recorded `prev_hash`.
    pub found: String,
}

/// Canonical digest of an entry.
///
/// # Errors
///
/// Returns an error if the entry cannot be serialized.
pub fn entry_digest(entry: &AuditEntry) -> Result<String, serde_json::Error> {
    Ok(sha256_bytes(&serde_json::to_vec(entry)?))
}

/// Verify links across `entries` with a single linear scan.
///
/// # Errors
///
/// Returns the first [`ChainBreak`].
pub fn verify_chain(entries: &[AuditEntry]) -> Result<(), ChainBreak> {
    let mut expected = GENESIS_HASH.to_owned();
    for (index, entry) in entries.iter().enumerate() {
        if entry.prev_hash != expected {
            return Err(ChainBreak {
                index,
                expected,
                found: entry.prev_hash.clone(),
            });
        }
        expected = entry_digest(entry).map_err(|e| ChainBreak {
            index,
            expected: String::new(),
            found: format!("unserializable entry: {e}"),
        })?;
    }
    Ok(())
}

/// Read every entry from a JSONL audit file without opening it for writing.
///
/// # Errors
///
/// Returns an error if the file cannot be read or a line is not an entry.
pub fn read_entries(path: &Path) -> anyhow::Result<Vec<AuditEntry>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open audit log {}", path.display()))?;
    let mut entries = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read audit log {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditEntry = serde_json::from_str(&line).with_context(|| {
            format!("malformed audit entry at line {}", n.saturating_add(1))
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

/// Audit log failures.
#[derive(Debug, Error)]
pub enum AuditError {
    /// An earlier failure left the log unusable until restored.
    #[error("audit log unavailable: {0}")]
    Degraded(String),

    /// Writing the entry failed; the log is now degraded.
    #[error("audit write failed: {0}")]
    Write(String),

    /// Restore found a broken chain on disk.
    #[error(transparent)]
    ChainBroken(#[from] ChainBreak),
}

/// Paginated query over the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditQuery {
    /// Maximum entries returned (0 means all).
    pub limit: usize,
    /// Entries skipped, counted from the newest.
    pub offset: usize,
    /// Only this event type.
    pub event_type: Option<AuditEventType>,
}

enum AuditSink {
    File { path: PathBuf, file: File },
    Writer(Box<dyn Write + Send>),
}

impl AuditSink {
    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        match self {
            Self::File { file, .. } => {
                writeln!(file, "{line}")?;
                file.flush()?;
                file.sync_data()
            }
            Self::Writer(writer) => {
                writeln!(writer, "{line}")?;
                writer.flush()
            }
        }
    }
}

struct AuditState {
    sink: AuditSink,
    entries: Vec<AuditEntry>,
    head: String,
    degraded: Option<String>,
}

/// The governance audit log.
pub struct AuditLog {
    state: Mutex<AuditState>,
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}

impl AuditLog {
    /// Open (or create) a JSONL audit file and verify the existing chain.
    ///
    /// An unreadable or broken chain does not fail the open; it leaves the
    /// log degraded so that no governed action can proceed on top of it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or opened for append.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create audit log directory {}", parent.display())
            })?;
        }
        let file = open_append(path)?;
        let (entries, head, degraded) = load_chain(path);
        if let Some(reason) = &degraded {
            error!(path = %path.display(), reason = %reason, "audit log degraded on open");
        } else {
            info!(path = %path.display(), entries = entries.len(), "audit log opened");
        }

        Ok(Self {
            state: Mutex::new(AuditState {
                sink: AuditSink::File {
                    path: path.to_path_buf(),
                    file,
                },
                entries,
                head,
                degraded,
            }),
        })
    }

    /// Create an empty log over an arbitrary writer.
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            state: Mutex::new(AuditState {
                sink: AuditSink::Writer(writer),
                entries: Vec::new(),
                head: GENESIS_HASH.to_owned(),
                degraded: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AuditState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("audit lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Seal and append a record.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Degraded`] while the log is degraded and
    /// [`AuditError::Write`] when this write fails (which degrades it).
    pub fn append(&self, record: AuditRecord) -> Result<AuditEntry, AuditError> {
        let mut state = self.lock();
        if let Some(reason) = &state.degraded {
            return Err(AuditError::Degraded(reason.clone()));
        }

        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: record.event_type,
            mode_before: record.mode_before,
            mode_after: record.mode_after,
            bundle_id: record.bundle_id,
            reason: record.reason,
            triggered_by: record.triggered_by,
            success: record.success,
            error: record.error,
            metadata: record.metadata,
            prev_hash: state.head.clone(),
        };

        let line = serde_json::to_string(&entry)
            .map_err(|e| AuditError::Write(format!("serialize entry: {e}")))?;
        let digest = sha256_bytes(line.as_bytes());

        if let Err(e) = state.sink.write_line(&line) {
            let reason = e.to_string();
            error!(
                event_type = %entry.event_type,
                error = %reason,
                "audit write failed, governance is now fail closed"
            );
            state.degraded = Some(reason.clone());
            return Err(AuditError::Write(reason));
        }

        state.head = digest;
        state.entries.push(entry.clone());
        Ok(entry)
    }

    /// Whether appends currently fail.
    pub fn is_degraded(&self) -> bool {
        self.lock().degraded.is_some()
    }

    /// Why the log is degraded, if it is.
    pub fn degraded_reason(&self) -> Option<String> {
        self.lock().degraded.clone()
    }

    /// Reopen the sink, re-verify the chain, and clear the degraded state.
    ///
    /// Appends an `audit_restored` entry recording the previous failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be reopened, the on-disk chain is
    /// broken, or the `audit_restored` entry cannot be written.
    pub fn restore(&self, triggered_by: TriggeredBy, reason: &str) -> Result<AuditEntry, AuditError> {
        let previous = {
            let mut state = self.lock();
            let previous = state.degraded.clone();
            if let AuditSink::File { path, .. } = &state.sink {
                let path = path.clone();
                let file = open_append(&path).map_err(|e| AuditError::Write(format!("{e:#}")))?;
                let (entries, head, degraded) = load_chain(&path);
                if let Some(still) = degraded {
                    state.degraded = Some(still.clone());
                    return Err(AuditError::Degraded(still));
                }
                state.sink = AuditSink::File { path, file };
                state.entries = entries;
                state.head = head;
            }
            state.degraded = None;
            previous
        };

        info!(previous = previous.as_deref().unwrap_or_default(), "audit log restored");
        self.append(
            AuditRecord::new(AuditEventType::AuditRestored, triggered_by, reason)
                .metadata(serde_json::json!({ "previous_error": previous })),
        )
    }

    /// Number of entries in the chain.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Digest of the newest entry (or [`GENESIS_HASH`]).
    pub fn head(&self) -> String {
        self.lock().head.clone()
    }

    /// Verify the in-memory chain including the recorded head.
    ///
    /// # Errors
    ///
    /// Returns the first [`ChainBreak`].
    pub fn verify(&self) -> Result<usize, ChainBreak> {
        let state = self.lock();
        verify_chain(&state.entries)?;
        let computed = match state.entries.last() {
            Some(last) => entry_digest(last).unwrap_or_default(),
            None => GENESIS_HASH.to_owned(),
        };
        if computed != state.head {
            return Err(ChainBreak {
                index: state.entries.len().saturating_sub(1),
                expected: state.head.clone(),
                found: computed,
            });
        }
        Ok(state.entries.len())
    }

    /// Newest-first page of entries.
    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        let state = self.lock();
        let limit = if query.limit == 0 { usize::MAX } else { query.limit };
        state
            .entries
            .iter()
            .rev()
            .filter(|e| query.event_type.map_or(true, |t| e.event_type == t))
            .skip(query.offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Entry counts keyed by event type label.
    pub fn count_by_type(&self) -> BTreeMap<AuditEventType, u64> {
        let state = self.lock();
        let mut counts = BTreeMap::new();
        for entry in &state.entries {
            let count: &mut u64 = counts.entry(entry.event_type).or_insert(0);
            *count = count.saturating_add(1);
        }
        counts
    }

    #[cfg(test)]
    fn tamper(&self, index: usize, reason: &str) {
        let mut state = self.lock();
        if let Some(entry) = state.entries.get_mut(index) {
            entry.reason = reason.to_owned();
        }
    }
}

fn open_append(path: &Path) -> anyhow::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open audit log {}", path.display()))
}

/// Returns `(entries, head, degraded_reason)`.
fn load_chain(path: &Path) -> (Vec<AuditEntry>, String, Option<String>) {
    let entries = match read_entries(path) {
        Ok(entries) => entries,
        Err(e) => return (Vec::new(), GENESIS_HASH.to_owned(), Some(format!("{e:#}"))),
    };
    if let Err(brk) = verify_chain(&entries) {
        return (entries, GENESIS_HASH.to_owned(), Some(brk.to_string()));
    }
    let head = match entries.last().map(entry_digest).transpose() {
        Ok(Some(head)) => head,
        Ok(None) => GENESIS_HASH.to_owned(),
        Err(e) => return (entries, GENESIS_HASH.to_owned(), Some(e.to_string())),
    };
    (entries, head, None)
}
