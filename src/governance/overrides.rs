//! Time-boxed, audited bypass of the preflight gates.
//!
//! At most one override is active. Expiry is checked lazily: the first
//! query at or after `expires_at` clears the override and records
//! `override_expired`. Activation only happens once its audit entry is
//! written.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::audit::{AuditError, AuditEventType, AuditLog, AuditRecord};
use crate::config::LiveConfig;
use crate::signals::GovernanceSignals;
use crate::types::TriggeredBy;

/// The active override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverrideState {
    /// Why the override was granted.
    pub reason: String,
    /// When it began.
    pub started_at: DateTime<Utc>,
    /// When it lapses.
    pub expires_at: DateTime<Utc>,
}

impl OverrideState {
    /// Seconds left at `now` (zero once expired).
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from(self.expires_at.signed_duration_since(now).num_seconds()).unwrap_or(0)
    }
}

/// Override request failures.
#[derive(Debug, Error)]
pub enum OverrideError {
    /// Another override is running.
    #[error("an override is already active until {expires_at}")]
    AlreadyActive {
        /// Expiry of the running override.
        expires_at: DateTime<Utc>,
    },

    /// TTL is zero or above `overrides.max_ttl_secs`.
    #[error("override ttl must be between 1 and {max_secs} seconds (got {requested_secs})")]
    InvalidTtl {
        /// Requested TTL.
        requested_secs: u64,
        /// Configured maximum.
        max_secs: u64,
    },

    /// `end_override` with nothing active.
    #[error("no override is active")]
    NotActive,

    /// The audit entry could not be written; nothing was activated.
    #[error(transparent)]
    Audit(#[from] AuditError),
}

/// Override governor.
pub struct OverrideGovernor {
    state: Mutex<Option<OverrideState>>,
    audit: Arc<AuditLog>,
    config: LiveConfig,
    signals: GovernanceSignals,
}

impl OverrideGovernor {
    /// Governor with no active override.
    pub fn new(audit: Arc<AuditLog>, config: LiveConfig, signals: GovernanceSignals) -> Self {
        Self {
            state: Mutex::new(None),
            audit,
            config,
            signals,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<OverrideState>> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("override lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Start an override lasting `ttl`.
    ///
    /// # Errors
    ///
    /// See [`OverrideError`]. Every outcome is audited.
    pub fn begin_override(&self, reason: &str, ttl: Duration) -> Result<OverrideState, OverrideError> {
        self.begin_override_at(reason, ttl, Utc::now())
    }

    /// [`Self::begin_override`] at an explicit clock reading.
    ///
    /// # Errors
    ///
    /// See [`OverrideError`].
    pub fn begin_override_at(
        &self,
        reason: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<OverrideState, OverrideError> {
        let mut guard = self.lock();
        self.expire_locked(&mut guard, now);

        let max_secs = self.config.snapshot().overrides.max_ttl_secs;
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|d| now.checked_add_signed(d));

        let rejection = match (guard.as_ref(), expires_at) {
            (Some(active), _) => Some(OverrideError::AlreadyActive {
                expires_at: active.expires_at,
            }),
            (None, _) if ttl.is_zero() || ttl.as_secs() > max_secs => Some(OverrideError::InvalidTtl {
                requested_secs: ttl.as_secs(),
                max_secs,
            }),
            (None, None) => Some(OverrideError::InvalidTtl {
                requested_secs: ttl.as_secs(),
                max_secs,
            }),
            (None, Some(_)) => None,
        };

        let metadata = serde_json::json!({ "ttl_secs": ttl.as_secs() });
        if let Some(err) = rejection {
            self.signals.override_event("rejected");
            warn!(reason, error = %err, "override rejected");
            let record = AuditRecord::new(AuditEventType::OverrideBegin, TriggeredBy::Operator, reason)
                .failed(err.to_string())
                .metadata(metadata);
            if let Err(audit_err) = self.audit.append(record) {
                error!(error = %audit_err, "failed to audit override rejection");
            }
            return Err(err);
        }

        let state = OverrideState {
            reason: reason.to_owned(),
            started_at: now,
            expires_at: expires_at.unwrap_or(now),
        };
        self.audit.append(
            AuditRecord::new(AuditEventType::OverrideBegin, TriggeredBy::Operator, reason).metadata(
                serde_json::json!({
                    "ttl_secs": ttl.as_secs(),
                    "expires_at": state.expires_at,
                }),
            ),
        )?;

        *guard = Some(state.clone());
        self.signals.override_event("begin");
        self.signals.set_override_active(true);
        info!(reason, expires_at = %state.expires_at, "override active");
        Ok(state)
    }

    /// End the active override.
    ///
    /// Ending always takes effect; a failed audit write is logged.
    ///
    /// # Errors
    ///
    /// Returns [`OverrideError::NotActive`] when nothing is active.
    pub fn end_override(&self, reason: &str) -> Result<OverrideState, OverrideError> {
        self.end_override_at(reason, Utc::now())
    }

    /// [`Self::end_override`] at an explicit clock reading.
    ///
    /// # Errors
    ///
    /// Returns [`OverrideError::NotActive`] when nothing is active.
    pub fn end_override_at(&self, reason: &str, now: DateTime<Utc>) -> Result<OverrideState, OverrideError> {
        let mut guard = self.lock();
        self.expire_locked(&mut guard, now);

        let Some(ended) = guard.take() else {
            let err = OverrideError::NotActive;
            if let Err(audit_err) = self.audit.append(
                AuditRecord::new(AuditEventType::OverrideEnd, TriggeredBy::Operator, reason)
                    .failed(err.to_string()),
            ) {
                error!(error = %audit_err, "failed to audit override end");
            }
            return Err(err);
        };

        self.signals.override_event("end");
        self.signals.set_override_active(false);
        if let Err(audit_err) = self.audit.append(
            AuditRecord::new(AuditEventType::OverrideEnd, TriggeredBy::Operator, reason).metadata(
                serde_json::json!({
                    "granted_reason": ended.reason,
                    "remaining_secs": ended.remaining_secs(now),
                }),
            ),
        ) {
            error!(error = %audit_err, "override ended but the audit write failed");
        }
        info!(reason, "override ended");
        Ok(ended)
    }

    /// The active override, clearing it first if it has expired.
    pub fn active(&self) -> Option<OverrideState> {
        self.active_at(Utc::now())
    }

    /// [`Self::active`] at an explicit clock reading.
    pub fn active_at(&self, now: DateTime<Utc>) -> Option<OverrideState> {
        let mut guard = self.lock();
        self.expire_locked(&mut guard, now);
        guard.clone()
    }

    fn expire_locked(&self, guard: &mut Option<OverrideState>, now: DateTime<Utc>) {
        let expired = guard.as_ref().is_some_and(|s| now >= s.expires_at);
        if !expired {
            return;
        }
        let Some(lapsed) = guard.take() else {
            return;
        };
        self.signals.override_event("expired");
        self.signals.set_override_active(false);
        info!(reason = %lapsed.reason, expires_at = %lapsed.expires_at, "override expired");
        if let Err(e) = self.audit.append(
            AuditRecord::new(AuditEventType::OverrideExpired, TriggeredBy::Override, &lapsed.reason)
                .metadata(serde_json::json!({ "expired_at": lapsed.expires_at })),
        ) {
            error!(error = %e, "failed to audit override expiry");
        }
    }
}
