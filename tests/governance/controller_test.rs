//! Tests for `src/governance/controller.rs`: the mode state machine.

use std::time::Duration;

use sovereign::audit::{AuditEventType, AuditQuery};
use sovereign::bundle::registry::LoadOptions;
use sovereign::governance::{GateName, GovernanceError, GovernanceEvent, RejectionKind, TransitionRequest};
use sovereign::types::{BundleStatus, OperationMode, TriggeredBy};

use crate::support::{harness, test_config, Harness};

fn newest_mode_change(h: &Harness) -> sovereign::audit::AuditEntry {
    h.audit
        .query(&AuditQuery {
            limit: 1,
            event_type: Some(AuditEventType::ModeChange),
            ..AuditQuery::default()
        })
        .into_iter()
        .next()
        .expect("a mode_change entry should exist")
}

async fn enter_quarantine(h: &Harness) {
    h.service
        .transition(TransitionRequest::operator(OperationMode::Quarantine, "incident"))
        .await
        .expect("entering quarantine always succeeds");
}

#[tokio::test]
async fn starts_online_with_no_bundle() {
    let h = harness(test_config()).await;
    let mode = h.service.mode().await;
    assert_eq!(mode.mode, OperationMode::Online);
    assert!(mode.active_bundle.is_none());
    assert!(mode.last_mode_change.is_none());
}

#[tokio::test]
async fn same_mode_request_is_an_audited_noop() {
    let h = harness(test_config()).await;
    let report = h
        .service
        .transition(TransitionRequest::operator(OperationMode::Online, "noop"))
        .await
        .expect("no-op succeeds");

    assert!(!report.changed);
    assert!(report.audit_id.is_some());
    let entry = newest_mode_change(&h);
    assert!(entry.success);
    assert_eq!(entry.mode_before, Some(OperationMode::Online));
    assert_eq!(entry.mode_after, Some(OperationMode::Online));
    assert!(h.service.mode().await.last_mode_change.is_none());
}

#[tokio::test]
async fn offline_transition_loads_requested_bundle() {
    let h = harness(test_config()).await;
    h.add_validated_bundle("b1").await;

    let report = h
        .service
        .transition(TransitionRequest::operator(OperationMode::Offline, "travel").with_bundle("b1"))
        .await
        .expect("offline transition succeeds");

    assert!(report.changed);
    assert_eq!(report.previous, OperationMode::Online);
    assert_eq!(report.snapshot.mode, OperationMode::Offline);
    assert_eq!(report.snapshot.active_bundle.as_deref(), Some("b1"));
    assert_eq!(report.snapshot.last_reason.as_deref(), Some("travel"));

    let b1 = h.service.get_bundle("b1").await.expect("b1 exists");
    assert_eq!(b1.status, BundleStatus::Loaded);
    assert_eq!(b1.load_count, 1);

    let entry = newest_mode_change(&h);
    assert!(entry.success);
    assert_eq!(entry.bundle_id.as_deref(), Some("b1"));
    assert_eq!(entry.triggered_by, TriggeredBy::Operator);

    let events = h.recorder.events();
    assert!(events.contains(&GovernanceEvent::BundleLoaded {
        bundle_id: "b1".to_owned(),
        demoted: None,
    }));
    assert!(events.contains(&GovernanceEvent::ModeChanged {
        from: OperationMode::Online,
        to: OperationMode::Offline,
        bundle_id: Some("b1".to_owned()),
        triggered_by: TriggeredBy::Operator,
    }));
}

#[tokio::test]
async fn sovereign_with_pending_bundle_is_rejected_and_audited() {
    let h = harness(test_config()).await;
    h.add_bundle("b1").await;

    let rejection = h
        .service
        .transition(TransitionRequest::operator(OperationMode::Sovereign, "lockdown").with_bundle("b1"))
        .await
        .expect_err("pending bundle fails the trust gate");

    assert_eq!(rejection.kind, RejectionKind::GateFailure);
    assert_eq!(rejection.from, OperationMode::Online);
    assert!(rejection
        .gate_failures
        .iter()
        .any(|f| f.gate == GateName::BundleTrust));
    assert!(!rejection.reasons.is_empty());

    assert_eq!(h.service.mode().await.mode, OperationMode::Online);
    let b1 = h.service.get_bundle("b1").await.expect("b1 exists");
    assert_eq!(b1.status, BundleStatus::Pending, "rejection leaves the bundle untouched");

    let entry = newest_mode_change(&h);
    assert!(!entry.success);
    assert_eq!(entry.mode_after, Some(OperationMode::Online));
    assert!(entry.error.is_some());
}

#[tokio::test]
async fn rejection_carries_every_gate_failure() {
    let h = harness(test_config()).await;
    h.isolation.set_ipv6_disabled(false);

    let rejection = h
        .service
        .transition(TransitionRequest::operator(OperationMode::Offline, "no bundle"))
        .await
        .expect_err("ipv6 and trust gates fail");

    let gates: Vec<GateName> = rejection.gate_failures.iter().map(|f| f.gate).collect();
    assert_eq!(gates, vec![GateName::Ipv6, GateName::BundleTrust]);
    assert_eq!(rejection.reasons.len(), 2);
    assert_eq!(h.service.signals().gate_failures(GateName::Ipv6), 1);
}

#[tokio::test]
async fn entering_quarantine_succeeds_regardless_of_gates() {
    let h = harness(test_config()).await;
    h.probe.set_online(false);
    h.isolation.set_ipv6_disabled(false);

    let report = h
        .service
        .transition(TransitionRequest::operator(OperationMode::Quarantine, "suspected compromise"))
        .await
        .expect("quarantine entry always passes");
    assert_eq!(report.snapshot.mode, OperationMode::Quarantine);
}

#[tokio::test]
async fn leaving_quarantine_without_override_is_denied() {
    let h = harness(test_config()).await;
    enter_quarantine(&h).await;

    for request in [
        TransitionRequest::operator(OperationMode::Online, "resume"),
        TransitionRequest::operator(OperationMode::Online, "resume").forced(),
    ] {
        let rejection = h
            .service
            .transition(request)
            .await
            .expect_err("quarantine exit needs an override");
        assert_eq!(rejection.kind, RejectionKind::QuarantineExitDenied);
    }
    assert_eq!(h.service.mode().await.mode, OperationMode::Quarantine);
    assert!(!newest_mode_change(&h).success);
}

#[tokio::test]
async fn override_allows_forced_quarantine_exit_until_it_expires() {
    let h = harness(test_config()).await;
    enter_quarantine(&h).await;
    h.probe.set_online(false);

    h.service
        .begin_override("emergency", Duration::from_secs(300))
        .expect("override granted");
    let report = h
        .service
        .transition(TransitionRequest::operator(OperationMode::Online, "restore service").forced())
        .await
        .expect("forced exit under override succeeds even with gates failing");
    assert!(report.forced);
    assert_eq!(report.snapshot.mode, OperationMode::Online);
    assert_eq!(newest_mode_change(&h).triggered_by, TriggeredBy::Override);

    enter_quarantine(&h).await;
    let later = chrono::Utc::now()
        .checked_add_signed(chrono::Duration::seconds(301))
        .expect("in range");
    assert!(h.service.overrides().active_at(later).is_none(), "override lapsed");

    let rejection = h
        .service
        .transition(TransitionRequest::operator(OperationMode::Online, "again").forced())
        .await
        .expect_err("expired override no longer authorizes the exit");
    assert_eq!(rejection.kind, RejectionKind::QuarantineExitDenied);

    let expired = h.audit.query(&AuditQuery {
        event_type: Some(AuditEventType::OverrideExpired),
        ..AuditQuery::default()
    });
    assert_eq!(expired.len(), 1);
}

#[tokio::test]
async fn force_without_override_is_rejected() {
    let h = harness(test_config()).await;
    h.add_bundle("b1").await;

    let rejection = h
        .service
        .transition(TransitionRequest::operator(OperationMode::Sovereign, "skip gates").forced())
        .await
        .expect_err("force needs an override");
    assert_eq!(rejection.kind, RejectionKind::OverrideRequired);
    assert_eq!(h.service.mode().await.mode, OperationMode::Online);
}

#[tokio::test]
async fn leaving_offline_unloads_the_active_bundle() {
    let h = harness(test_config()).await;
    h.add_validated_bundle("b1").await;
    h.service
        .transition(TransitionRequest::operator(OperationMode::Offline, "travel").with_bundle("b1"))
        .await
        .expect("offline transition succeeds");

    let report = h
        .service
        .transition(TransitionRequest::operator(OperationMode::Online, "back"))
        .await
        .expect("online transition succeeds");
    assert!(report.snapshot.active_bundle.is_none());
    let b1 = h.service.get_bundle("b1").await.expect("b1 exists");
    assert_eq!(b1.status, BundleStatus::Validated);
}

#[tokio::test]
async fn offline_to_sovereign_keeps_the_active_bundle() {
    let h = harness(test_config()).await;
    h.add_validated_bundle("b1").await;
    h.service
        .transition(TransitionRequest::operator(OperationMode::Offline, "travel").with_bundle("b1"))
        .await
        .expect("offline transition succeeds");

    let report = h
        .service
        .transition(TransitionRequest::operator(OperationMode::Sovereign, "tighten"))
        .await
        .expect("sovereign transition succeeds");
    assert_eq!(report.snapshot.active_bundle.as_deref(), Some("b1"));
    let load = report.load.expect("load step ran");
    assert!(load.already_loaded);
}

#[tokio::test]
async fn fallback_bundle_is_used_when_none_requested() {
    let mut config = test_config();
    config.fallback.fallback_bundle_id = Some("b2".to_owned());
    let h = harness(config).await;
    h.add_validated_bundle("b2").await;

    let report = h
        .service
        .transition(TransitionRequest::operator(OperationMode::Offline, "use fallback"))
        .await
        .expect("fallback bundle is loaded");
    assert_eq!(report.snapshot.active_bundle.as_deref(), Some("b2"));
}

#[tokio::test]
async fn degraded_audit_log_refuses_every_transition() {
    let h = harness(test_config()).await;
    h.add_validated_bundle("b1").await;
    h.break_audit();

    let rejection = h
        .service
        .transition(TransitionRequest::operator(OperationMode::Offline, "travel").with_bundle("b1"))
        .await
        .expect_err("audit write fails, nothing commits");
    assert_eq!(rejection.kind, RejectionKind::AuditUnavailable);
    assert_eq!(h.service.mode().await.mode, OperationMode::Online);
    let b1 = h.service.get_bundle("b1").await.expect("b1 exists");
    assert_eq!(b1.status, BundleStatus::Validated, "load rolled back");

    h.heal_audit();
    let rejection = h
        .service
        .transition(TransitionRequest::operator(OperationMode::Quarantine, "incident"))
        .await
        .expect_err("degraded log still refuses until restored");
    assert_eq!(rejection.kind, RejectionKind::AuditUnavailable);

    let restored = h.service.restore_audit("disk replaced").expect("restore succeeds");
    assert_eq!(restored.event_type, AuditEventType::AuditRestored);
    h.service
        .transition(TransitionRequest::operator(OperationMode::Quarantine, "incident"))
        .await
        .expect("transitions resume after restore");
}

#[tokio::test]
async fn load_bundle_rolls_back_when_unrecorded() {
    let h = harness(test_config()).await;
    h.add_validated_bundle("b1").await;
    h.break_audit();

    let err = h
        .service
        .load_bundle("b1", LoadOptions::default(), "preload")
        .await
        .expect_err("unrecorded load is undone");
    assert!(matches!(err, GovernanceError::Audit(_)));
    let b1 = h.service.get_bundle("b1").await.expect("b1 exists");
    assert_eq!(b1.status, BundleStatus::Validated);
}

#[tokio::test]
async fn remove_quarantine_is_audited() {
    let h = harness(test_config()).await;
    h.add_bundle("b1").await;
    crate::support::tamper_artifact(&h.bundles_dir, "b1");
    h.service.validate("b1", false).await.expect("validation runs");

    let cleared = h
        .service
        .remove_quarantine("b1", "artifact replaced")
        .await
        .expect("quarantine removed");
    assert_eq!(cleared.status, BundleStatus::Pending);

    let entries = h.audit.query(&AuditQuery {
        event_type: Some(AuditEventType::QuarantineRemoved),
        ..AuditQuery::default()
    });
    assert_eq!(entries.len(), 1);
    assert!(entries[0].success);
    assert_eq!(entries[0].bundle_id.as_deref(), Some("b1"));
}

#[tokio::test]
async fn switch_counts_track_committed_transitions() {
    let h = harness(test_config()).await;
    enter_quarantine(&h).await;
    let _ = h
        .service
        .transition(TransitionRequest::operator(OperationMode::Online, "denied"))
        .await;

    let stats = h.service.statistics().await.expect("statistics");
    assert_eq!(stats.mode_switches.get(&OperationMode::Quarantine), Some(&1));
    assert_eq!(stats.mode_switches.get(&OperationMode::Online), None);
    assert_eq!(h.service.signals().mode_switch_attempts(OperationMode::Online), 1);
}
