//! Shared closed enums for the governance engine.
//!
//! Every consumer matches these exhaustively; the string forms exist only
//! for persistence, audit serialization, and metric labels.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a persisted or user-supplied label is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseLabelError {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The rejected value.
    pub value: String,
}

// ---------------------------------------------------------------------------
// OperationMode
// ---------------------------------------------------------------------------

/// Platform operation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    /// External network access permitted.
    Online,
    /// No external access; a validated bundle serves requests.
    Offline,
    /// Offline plus inbound isolation.
    Sovereign,
    /// Isolation only. The safe fallback state.
    Quarantine,
}

impl OperationMode {
    /// All modes, in declaration order.
    pub const ALL: [OperationMode; 4] = [
        OperationMode::Online,
        OperationMode::Offline,
        OperationMode::Sovereign,
        OperationMode::Quarantine,
    ];

    /// Stable lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Sovereign => "sovereign",
            Self::Quarantine => "quarantine",
        }
    }

    /// Whether this mode serves requests from a loaded bundle.
    pub fn requires_bundle(&self) -> bool {
        match self {
            Self::Offline | Self::Sovereign => true,
            Self::Online | Self::Quarantine => false,
        }
    }

    /// Whether this mode requires egress isolation (no IPv6 leakage).
    pub fn requires_isolation(&self) -> bool {
        match self {
            Self::Offline | Self::Sovereign | Self::Quarantine => true,
            Self::Online => false,
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationMode {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "sovereign" => Ok(Self::Sovereign),
            "quarantine" => Ok(Self::Quarantine),
            other => Err(ParseLabelError {
                kind: "operation mode",
                value: other.to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// BundleStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a model bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleStatus {
    /// Discovered, never validated (or quarantine was removed).
    Pending,
    /// Digests verified against recorded trust material.
    Validated,
    /// Currently serving. At most one bundle holds this status.
    Loaded,
    /// Failed trust verification; cleared only by explicit removal.
    Quarantined,
    /// Failed validation with quarantine disabled.
    Failed,
}

impl BundleStatus {
    /// All statuses, in declaration order.
    pub const ALL: [BundleStatus; 5] = [
        BundleStatus::Pending,
        BundleStatus::Validated,
        BundleStatus::Loaded,
        BundleStatus::Quarantined,
        BundleStatus::Failed,
    ];

    /// Stable lowercase label stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validated => "validated",
            Self::Loaded => "loaded",
            Self::Quarantined => "quarantined",
            Self::Failed => "failed",
        }
    }

    /// Whether a bundle in this status may back an offline mode.
    pub fn is_trusted(&self) -> bool {
        match self {
            Self::Validated | Self::Loaded => true,
            Self::Pending | Self::Quarantined | Self::Failed => false,
        }
    }
}

impl fmt::Display for BundleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BundleStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "validated" => Ok(Self::Validated),
            "loaded" => Ok(Self::Loaded),
            "quarantined" => Ok(Self::Quarantined),
            "failed" => Ok(Self::Failed),
            other => Err(ParseLabelError {
                kind: "bundle status",
                value: other.to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// TriggeredBy
// ---------------------------------------------------------------------------

/// Originator of a governance decision, recorded on every audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggeredBy {
    /// A human operator via the CLI or REST wrapper.
    #[serde(rename = "operator")]
    Operator,
    /// The background network monitor.
    #[serde(rename = "auto-network-monitor")]
    AutoNetworkMonitor,
    /// A transition executed under an active override.
    #[serde(rename = "override")]
    Override,
}

impl TriggeredBy {
    /// Stable label as written to the audit log.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Operator => "operator",
            Self::AutoNetworkMonitor => "auto-network-monitor",
            Self::Override => "override",
        }
    }
}

impl fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
