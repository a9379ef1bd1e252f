//! Tests for `src/bundle/store.rs`: persistence and the atomic promote pair.

use sovereign::bundle::store::{BundleStore, Promotion};
use sovereign::types::BundleStatus;

use crate::support::{harness, test_config};

#[tokio::test]
async fn rows_survive_reopening_the_database() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let db = tmp.path().join("state.db");
    let h = harness(test_config()).await;
    h.add_validated_bundle("b1").await;
    let original = h.service.get_bundle("b1").await.expect("b1 exists");

    {
        let store = BundleStore::open(&db).await.expect("should open store");
        assert!(store.insert_if_absent(&original).await.expect("insert"));
        assert!(!store.insert_if_absent(&original).await.expect("insert"), "second insert is a no-op");
    }

    let reopened = BundleStore::open(&db).await.expect("should reopen store");
    let loaded = reopened.get("b1").await.expect("read").expect("row exists");
    assert_eq!(loaded.status, BundleStatus::Validated);
    assert_eq!(loaded.artifact_digest, original.artifact_digest);
    assert_eq!(loaded.requirements, original.requirements);
    assert_eq!(loaded.last_validated, original.last_validated);
}

#[tokio::test]
async fn promote_requires_validated_status() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let h = harness(test_config()).await;
    h.add_bundle("b1").await;
    let pending = h.service.get_bundle("b1").await.expect("b1 exists");

    let store = BundleStore::open(&tmp.path().join("state.db"))
        .await
        .expect("should open store");
    store.insert_if_absent(&pending).await.expect("insert");

    let outcome = store.promote("b1", chrono::Utc::now()).await.expect("promote runs");
    assert_eq!(outcome, Promotion::NotValidated);
    let row = store.get("b1").await.expect("read").expect("row exists");
    assert_eq!(row.status, BundleStatus::Pending);
    assert_eq!(row.load_count, 0);
}

#[tokio::test]
async fn reinstate_restores_previous_loaded_bundle() {
    let h = harness(test_config()).await;
    h.add_validated_bundle("b1").await;
    h.add_validated_bundle("b2").await;
    h.registry
        .load("b1", Default::default())
        .await
        .expect("b1 should load");
    h.registry
        .load("b2", Default::default())
        .await
        .expect("b2 should load");

    h.registry
        .reinstate(Some("b1"), Some("b2"))
        .await
        .expect("reinstate should succeed");

    let loaded = h.registry.loaded().await.expect("read").expect("one loaded");
    assert_eq!(loaded.id, "b1");
    let counts = h.registry.count_by_status().await.expect("counts");
    assert_eq!(counts.get(&BundleStatus::Loaded), Some(&1));
    assert_eq!(counts.get(&BundleStatus::Validated), Some(&1));
    assert_eq!(counts.get(&BundleStatus::Quarantined), Some(&0));
}
