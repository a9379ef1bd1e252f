//! Tests for bundle validation overlapping transitions, and for quarantine
//! raised by a load's own validation pass.

use std::sync::Arc;
use std::time::Duration;

use sovereign::audit::{AuditEventType, AuditQuery};
use sovereign::bundle::registry::LoadOptions;
use sovereign::bundle::BundleError;
use sovereign::governance::{GovernanceError, GovernanceEvent, RejectionKind, TransitionRequest};
use sovereign::types::{BundleStatus, OperationMode, TriggeredBy};

use crate::support::{harness, tamper_artifact, test_config, write_bundle, Harness, SIGNER};

/// A service whose validation of a 16 MiB artifact takes thousands of reads.
async fn slow_hash_harness() -> Harness {
    let mut config = test_config();
    config.trust.chunk_size_bytes = 4096;
    let h = harness(config).await;
    write_bundle(&h.bundles_dir, "b1", &vec![7_u8; 16 * 1024 * 1024], Some(SIGNER));
    write_bundle(&h.bundles_dir, "b2", b"weights for b2", Some(SIGNER));
    h.service.discover().await.expect("discovery should succeed");
    for id in ["b1", "b2"] {
        h.service.validate(id, false).await.expect("validation should run");
    }
    h.service
        .transition(TransitionRequest::operator(OperationMode::Offline, "travel").with_bundle("b1"))
        .await
        .expect("offline transition succeeds");
    h
}

fn quarantine_entries(h: &Harness) -> Vec<sovereign::audit::AuditEntry> {
    h.audit.query(&AuditQuery {
        event_type: Some(AuditEventType::BundleQuarantined),
        ..AuditQuery::default()
    })
}

#[tokio::test]
async fn revalidation_overlapping_an_unload_keeps_the_demotion() {
    let h = slow_hash_harness().await;

    let service = Arc::clone(&h.service);
    let validation = tokio::spawn(async move { service.validate("b1", true).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.service
        .transition(TransitionRequest::operator(OperationMode::Online, "back"))
        .await
        .expect("online transition succeeds");

    let outcome = validation
        .await
        .expect("validation task should not panic")
        .expect("validation succeeds");
    assert!(outcome.result().is_some_and(|r| r.is_valid));

    let b1 = h.service.get_bundle("b1").await.expect("b1 exists");
    assert_eq!(b1.status, BundleStatus::Validated);
    assert!(b1.last_validated.is_some());
    assert!(h.registry.loaded().await.expect("loaded query").is_none());

    let mode = h.service.mode().await;
    assert_eq!(mode.mode, OperationMode::Online);
    assert!(mode.active_bundle.is_none());
}

#[tokio::test]
async fn revalidation_overlapping_a_swap_keeps_one_loaded_bundle() {
    let h = slow_hash_harness().await;

    let service = Arc::clone(&h.service);
    let validation = tokio::spawn(async move { service.validate("b1", true).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.service
        .transition(TransitionRequest::operator(OperationMode::Sovereign, "lockdown").with_bundle("b2"))
        .await
        .expect("sovereign transition succeeds");

    validation
        .await
        .expect("validation task should not panic")
        .expect("an untouched bundle validates");

    let b1 = h.service.get_bundle("b1").await.expect("b1 exists");
    assert_eq!(b1.status, BundleStatus::Validated);
    let loaded = h
        .registry
        .loaded()
        .await
        .expect("loaded query")
        .expect("one loaded bundle");
    assert_eq!(loaded.id, "b2");
    assert_eq!(h.service.mode().await.active_bundle.as_deref(), Some("b2"));
}

#[tokio::test]
async fn quarantine_during_load_is_audited_and_published() {
    let h = harness(test_config()).await;
    h.add_bundle("b1").await;
    tamper_artifact(&h.bundles_dir, "b1");

    let err = h
        .service
        .load_bundle("b1", LoadOptions::default(), "preload")
        .await
        .expect_err("tampered bundle must not load");
    assert!(matches!(
        err,
        GovernanceError::Bundle(BundleError::LoadRejected {
            status: BundleStatus::Quarantined,
            quarantined: true,
            ..
        })
    ));

    let entries = quarantine_entries(&h);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].bundle_id.as_deref(), Some("b1"));
    assert_eq!(entries[0].triggered_by, TriggeredBy::Operator);
    assert!(h
        .recorder
        .events()
        .iter()
        .any(|e| matches!(e, GovernanceEvent::BundleQuarantined { bundle_id, .. } if bundle_id == "b1")));
    assert_eq!(h.service.signals().quarantines(), 1);

    // A second attempt finds the bundle already quarantined; nothing new is recorded.
    let _ = h.service.load_bundle("b1", LoadOptions::default(), "retry").await;
    assert_eq!(quarantine_entries(&h).len(), 1);
}

#[tokio::test]
async fn quarantine_during_transition_load_is_audited() {
    let mut config = test_config();
    config.fallback.fallback_bundle_id = Some("b1".to_owned());
    let h = harness(config).await;
    h.add_bundle("b1").await;
    tamper_artifact(&h.bundles_dir, "b1");
    h.service
        .begin_override("field test", Duration::from_secs(60))
        .expect("override granted");

    // Forced, so the trust gate does not stop the pending bundle before its load.
    let rejection = h
        .service
        .transition(TransitionRequest::operator(OperationMode::Offline, "travel").forced())
        .await
        .expect_err("tampered bundle must not back OFFLINE");
    assert_eq!(rejection.kind, RejectionKind::BundleRejected);

    let entries = quarantine_entries(&h);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].triggered_by, TriggeredBy::Override);
    assert!(h
        .recorder
        .events()
        .iter()
        .any(|e| matches!(e, GovernanceEvent::BundleQuarantined { bundle_id, .. } if bundle_id == "b1")));
    assert_eq!(h.service.mode().await.mode, OperationMode::Online);
}

#[tokio::test]
async fn failed_quarantine_entry_detaches_the_untrusted_bundle() {
    let h = harness(test_config()).await;
    h.add_validated_bundle("b1").await;
    h.service
        .transition(TransitionRequest::operator(OperationMode::Sovereign, "lockdown").with_bundle("b1"))
        .await
        .expect("sovereign transition succeeds");

    tamper_artifact(&h.bundles_dir, "b1");
    h.break_audit();
    let outcome = h.service.validate("b1", true).await.expect("validation runs");
    assert!(outcome.newly_quarantined());

    let mode = h.service.mode().await;
    assert_eq!(mode.mode, OperationMode::Sovereign, "unrecorded transition is refused");
    assert!(mode.active_bundle.is_none());
    let b1 = h.service.get_bundle("b1").await.expect("b1 exists");
    assert_eq!(b1.status, BundleStatus::Quarantined);
}
