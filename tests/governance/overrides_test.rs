//! Tests for override handling through the service.

use std::time::Duration;

use sovereign::audit::{AuditEventType, AuditQuery};
use sovereign::governance::{OverrideError, RejectionKind, TransitionRequest};
use sovereign::types::OperationMode;

use crate::support::{harness, test_config};

#[tokio::test]
async fn override_lifecycle_is_reported_and_audited() {
    let h = harness(test_config()).await;

    let state = h
        .service
        .begin_override("emergency", Duration::from_secs(300))
        .expect("override granted");
    assert_eq!(state.reason, "emergency");
    assert!(h.service.signals().override_active());

    let status = h.service.status().await.expect("status");
    assert_eq!(status.active_override.as_ref().map(|o| o.reason.as_str()), Some("emergency"));

    let err = h
        .service
        .begin_override("second", Duration::from_secs(60))
        .expect_err("only one override at a time");
    assert!(matches!(err, OverrideError::AlreadyActive { .. }));

    let ended = h.service.end_override("resolved").expect("override ends");
    assert_eq!(ended.reason, "emergency");
    assert!(h.service.active_override().is_none());
    assert!(!h.service.signals().override_active());

    let err = h.service.end_override("again").expect_err("nothing to end");
    assert!(matches!(err, OverrideError::NotActive));

    let begins = h.audit.query(&AuditQuery {
        event_type: Some(AuditEventType::OverrideBegin),
        ..AuditQuery::default()
    });
    assert_eq!(begins.len(), 2);
    assert!(!begins[0].success);
    assert!(begins[1].success);

    let ends = h.audit.query(&AuditQuery {
        event_type: Some(AuditEventType::OverrideEnd),
        ..AuditQuery::default()
    });
    assert_eq!(ends.len(), 2);
}

#[tokio::test]
async fn ttl_above_configured_maximum_is_rejected() {
    let mut config = test_config();
    config.overrides.max_ttl_secs = 60;
    let h = harness(config).await;

    let err = h
        .service
        .begin_override("too long", Duration::from_secs(61))
        .expect_err("ttl over the maximum");
    assert!(matches!(
        err,
        OverrideError::InvalidTtl {
            requested_secs: 61,
            max_secs: 60
        }
    ));
    assert!(h.service.active_override().is_none());
}

#[tokio::test]
async fn forced_transition_bypasses_gates_under_override() {
    let h = harness(test_config()).await;
    h.isolation.set_ipv6_disabled(false);
    h.add_bundle("b1").await;

    h.service
        .begin_override("field test", Duration::from_secs(120))
        .expect("override granted");
    let rejection = h
        .service
        .transition(TransitionRequest::operator(OperationMode::Sovereign, "unforced").with_bundle("b1"))
        .await
        .expect_err("gates still apply without force");
    assert_eq!(rejection.kind, RejectionKind::GateFailure);

    // Force skips the gates but not the bundle lifecycle: a pending bundle
    // is validated on load.
    let report = h
        .service
        .transition(TransitionRequest::operator(OperationMode::Sovereign, "forced").with_bundle("b1").forced())
        .await
        .expect("forced transition succeeds");
    assert!(report.forced);
    assert_eq!(report.snapshot.active_bundle.as_deref(), Some("b1"));
}

#[tokio::test]
async fn expired_override_no_longer_authorizes_force() {
    let h = harness(test_config()).await;
    let past = chrono::Utc::now()
        .checked_sub_signed(chrono::Duration::seconds(600))
        .expect("in range");
    h.service
        .overrides()
        .begin_override_at("stale", Duration::from_secs(300), past)
        .expect("override granted in the past");

    assert!(h.service.active_override().is_none(), "expired on first query");
    let rejection = h
        .service
        .transition(TransitionRequest::operator(OperationMode::Offline, "forced").forced())
        .await
        .expect_err("force without an active override");
    assert_eq!(rejection.kind, RejectionKind::OverrideRequired);
}

#[tokio::test]
async fn ending_an_override_takes_effect_even_when_unrecorded() {
    let h = harness(test_config()).await;
    h.service
        .begin_override("emergency", Duration::from_secs(300))
        .expect("override granted");
    h.break_audit();

    h.service.end_override("resolved").expect("end always takes effect");
    assert!(h.service.active_override().is_none());
}

#[tokio::test]
async fn override_is_not_granted_when_unrecorded() {
    let h = harness(test_config()).await;
    h.break_audit();

    let err = h
        .service
        .begin_override("emergency", Duration::from_secs(300))
        .expect_err("activation requires an audit entry");
    assert!(matches!(err, OverrideError::Audit(_)));
    assert!(h.service.active_override().is_none());
}
