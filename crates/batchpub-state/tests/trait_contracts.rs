//! Trait contract tests for BatchStore, AssetStore, SiteStore and BlobStore.
//!
//! These tests verify the behavioral contracts of the storage traits
//! using in-memory fakes. Any conforming implementation must pass these.

use std::sync::Arc;

use batchpub_state::fakes::{MemoryAssetStore, MemoryBatchStore, MemoryBlobStore, MemorySiteStore};
use batchpub_state::*;
use chrono::{TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

fn open_batch() -> ChangeBatch {
    ChangeBatch::new(SiteId::new(), Uuid::new_v4())
}

// ===========================================================================
// BatchStore contract tests
// ===========================================================================

#[tokio::test]
async fn batch_load_missing_is_not_found() {
    let store = MemoryBatchStore::new();
    let err = store.load(&BatchId::new()).await.unwrap_err();

    assert!(matches!(err, StorageError::BatchNotFound { .. }));
}

#[tokio::test]
async fn batch_transition_applies_when_state_matches() {
    let store = MemoryBatchStore::new();
    let batch = open_batch();
    store.insert(batch.clone());

    let applied = store
        .transition(&batch.id, Transition::BEGIN, BatchPatch::default())
        .await
        .unwrap();

    assert!(applied);
    assert_eq!(
        store.load(&batch.id).await.unwrap().state,
        BatchState::Committing
    );
}

#[tokio::test]
async fn batch_transition_is_noop_when_state_moved() {
    let store = MemoryBatchStore::new();
    let batch = open_batch();
    store.insert(batch.clone());

    // Still open, so committing -> complete must not apply.
    let applied = store
        .transition(
            &batch.id,
            Transition::COMPLETE,
            BatchPatch::default().with_commit_sha("abc"),
        )
        .await
        .unwrap();

    assert!(!applied);
    let row = store.load(&batch.id).await.unwrap();
    assert_eq!(row.state, BatchState::Open);
    assert!(row.commit_sha.is_none());
    assert_eq!(store.writes(), 0);
}

#[tokio::test]
async fn batch_transition_merges_metadata_top_level() {
    let store = MemoryBatchStore::new();
    let mut batch = open_batch();
    batch.state = BatchState::Committing;
    batch
        .metadata
        .insert("uploaded_via".to_string(), json!("dashboard"));
    store.insert(batch.clone());

    let detail = ErrorDetail::AssetIntegrity {
        path: Some("img/a.png".into()),
        reason: "blob missing".into(),
    };
    store
        .transition(&batch.id, Transition::FAIL, BatchPatch::default().with_error(&detail))
        .await
        .unwrap();

    let row = store.load(&batch.id).await.unwrap();
    assert_eq!(row.state, BatchState::Failed);
    assert_eq!(row.metadata["uploaded_via"], "dashboard");
    assert!(row.metadata.contains_key("failed_at"));
    assert_eq!(row.error_detail(), Some(detail));
}

#[tokio::test]
async fn batch_transition_records_commit_sha() {
    let store = MemoryBatchStore::new();
    let mut batch = open_batch();
    batch.state = BatchState::Committing;
    store.insert(batch.clone());

    store
        .transition(
            &batch.id,
            Transition::COMPLETE,
            BatchPatch::default().with_commit_sha("0123456789abcdef0123456789abcdef01234567"),
        )
        .await
        .unwrap();

    let row = store.load(&batch.id).await.unwrap();
    assert_eq!(row.state, BatchState::Complete);
    assert_eq!(
        row.commit_sha.as_deref(),
        Some("0123456789abcdef0123456789abcdef01234567")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_cas_admits_exactly_one_winner() {
    let store = Arc::new(MemoryBatchStore::new());
    let batch = open_batch();
    store.insert(batch.clone());

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = Arc::clone(&store);
        let id = batch.id;
        tasks.push(tokio::spawn(async move {
            store
                .transition(&id, Transition::BEGIN, BatchPatch::default())
                .await
                .unwrap()
        }));
    }

    let mut winners = 0;
    for task in tasks {
        if task.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn rejected_transitions_report_lost_cas() {
    let store = MemoryBatchStore::new();
    let mut batch = open_batch();
    batch.state = BatchState::Committing;
    store.insert(batch.clone());
    store.reject_transitions_to(BatchState::Complete);

    let applied = store
        .transition(&batch.id, Transition::COMPLETE, BatchPatch::default())
        .await
        .unwrap();

    assert!(!applied);
    assert_eq!(store.get(&batch.id).unwrap().state, BatchState::Committing);
}

// ===========================================================================
// AssetStore contract tests
// ===========================================================================

#[tokio::test]
async fn assets_listed_by_repo_path() {
    let store = MemoryAssetStore::new();
    let batch = open_batch();
    let other = open_batch();
    store.insert(AssetVersion::staged(&batch, "s/2", "pages/z.md", b"z"));
    store.insert(AssetVersion::staged(&batch, "s/1", "assets/a.png", b"a"));
    store.insert(AssetVersion::staged(&other, "s/3", "assets/b.png", b"b"));

    let listed = store
        .list_by_batch(&batch.id, AssetStatus::Staged)
        .await
        .unwrap();

    let paths: Vec<_> = listed.iter().map(|a| a.repo_path.as_str()).collect();
    assert_eq!(paths, vec!["assets/a.png", "pages/z.md"]);
}

#[tokio::test]
async fn asset_status_update_is_scoped_to_batch_ids_and_status() {
    let store = MemoryAssetStore::new();
    let batch = open_batch();
    let other = open_batch();
    let a = AssetVersion::staged(&batch, "s/1", "a.txt", b"a");
    let mut pending = AssetVersion::staged(&batch, "s/2", "b.txt", b"b");
    pending.status = AssetStatus::Pending;
    let foreign = AssetVersion::staged(&other, "s/3", "c.txt", b"c");
    let late = AssetVersion::staged(&batch, "s/4", "d.txt", b"d");
    let ids = vec![a.id, pending.id, foreign.id];
    for asset in [a, pending, foreign, late] {
        store.insert(asset);
    }

    let changed = store
        .set_status(&batch.id, &ids, AssetStatus::Staged, AssetStatus::Committing)
        .await
        .unwrap();

    assert_eq!(changed, 1);
    let statuses: Vec<_> = store.all().iter().map(|a| a.status).collect();
    assert_eq!(
        statuses,
        vec![
            AssetStatus::Committing,
            AssetStatus::Pending,
            AssetStatus::Staged,
            AssetStatus::Staged
        ]
    );
}

// ===========================================================================
// SiteStore contract tests
// ===========================================================================

#[tokio::test]
async fn site_integration_update_keeps_other_settings() {
    let store = MemorySiteStore::new();
    let mut site = Site::new("docs", "acme/old", "main", 1);
    site.settings.insert("theme".into(), json!("dark"));
    store.insert(site.clone());

    let expires = Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap();
    store
        .update_integration(
            &site.id,
            SiteIntegration {
                github_installation_id: 77,
                repo_full_name: "acme/docs".into(),
                default_branch: "trunk".into(),
                github_app_slug: Some("acme-publisher".into()),
            },
            expires,
        )
        .await
        .unwrap();

    let row = store.load_site(&site.id).await.unwrap();
    assert_eq!(row.github_installation_id, 77);
    assert_eq!(row.repo_full_name, "acme/docs");
    assert_eq!(row.default_branch, "trunk");
    assert_eq!(row.settings["theme"], "dark");
    assert_eq!(row.token_expiry_hint(), Some(expires));
}

#[tokio::test]
async fn site_missing_is_not_found() {
    let store = MemorySiteStore::new();
    let err = store
        .record_token_expiry(&SiteId::new(), Utc::now())
        .await
        .unwrap_err();

    assert!(matches!(err, StorageError::SiteNotFound { .. }));
}

// ===========================================================================
// BlobStore contract tests
// ===========================================================================

#[tokio::test]
async fn blob_fetch_round_trip_and_miss() {
    let store = MemoryBlobStore::new();
    let data: Vec<u8> = (0u8..=255).collect();
    store.put("site/bin.dat", data.clone());

    assert_eq!(store.fetch("site/bin.dat").await.unwrap(), data);
    assert!(matches!(
        store.fetch("site/none").await.unwrap_err(),
        StorageError::BlobNotFound { .. }
    ));
    assert_eq!(store.fetches(), 2);
}
