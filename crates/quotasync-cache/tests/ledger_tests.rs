//! Integration tests for SqliteLedger
//!
//! These tests verify all ILedger methods using an in-memory SQLite
//! database. Each test function creates a fresh database to ensure test
//! isolation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;

use quotasync_cache::{DatabasePool, SqliteLedger};
use quotasync_core::domain::FileState;
use quotasync_core::ports::ILedger;

// ============================================================================
// Test helpers
// ============================================================================

/// Create a fresh in-memory ledger for each test
async fn setup() -> (DatabasePool, SqliteLedger) {
    let pool = DatabasePool::in_memory()
        .await
        .expect("Failed to create in-memory database");
    let ledger = SqliteLedger::new(pool.pool().clone());
    (pool, ledger)
}

/// Insert a file and walk it to `queued` with a staging path under /staging
async fn insert_queued(ledger: &SqliteLedger, path: &str, tree: &str, size: u64) -> PathBuf {
    ledger.insert(path, tree, size).await.unwrap();
    let staging = Path::new("/staging").join(tree).join(path);
    ledger.mark_queued(path, tree, &staging).await.unwrap();
    staging
}

/// Rewrite the `synced` column of every completed record to `secs_ago` seconds in the past
async fn backdate_synced(pool: &DatabasePool, secs_ago: i64) {
    sqlx::query("UPDATE files SET synced = ? WHERE state = 'completed'")
        .bind(Utc::now().timestamp() - secs_ago)
        .execute(pool.pool())
        .await
        .unwrap();
}

async fn state_of(ledger: &SqliteLedger, path: &str, tree: &str) -> FileState {
    ledger
        .lookup(path, tree)
        .await
        .unwrap()
        .expect("record exists")
        .state
}

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test]
async fn test_insert_and_lookup() {
    let (_pool, ledger) = setup().await;

    assert!(ledger.lookup("a.mp4", "cams").await.unwrap().is_none());
    assert!(ledger.insert("a.mp4", "cams", 1024).await.unwrap());

    let record = ledger.lookup("a.mp4", "cams").await.unwrap().unwrap();
    assert_eq!(record.path, "a.mp4");
    assert_eq!(record.tree, "cams");
    assert_eq!(record.size, 1024);
    assert_eq!(record.state, FileState::New);
    assert!(record.staging_path.is_none());
    assert!(record.synced_at.is_none());
    assert!((Utc::now() - record.created_at).num_seconds() < 5);
}

#[tokio::test]
async fn test_insert_is_idempotent() {
    let (pool, ledger) = setup().await;

    assert!(ledger.insert("a.mp4", "cams", 1024).await.unwrap());
    // Rediscovery with a different size is a no-op: size is captured once
    assert!(!ledger.insert("a.mp4", "cams", 4096).await.unwrap());

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
        .fetch_one(pool.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(
        ledger.lookup("a.mp4", "cams").await.unwrap().unwrap().size,
        1024
    );
}

#[tokio::test]
async fn test_same_path_in_two_trees_are_distinct() {
    let (_pool, ledger) = setup().await;

    assert!(ledger.insert("clip.mp4", "cams", 1).await.unwrap());
    assert!(ledger.insert("clip.mp4", "uploads", 2).await.unwrap());

    assert_eq!(ledger.list_new().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_rediscovery_does_not_reset_state() {
    let (_pool, ledger) = setup().await;

    insert_queued(&ledger, "a.mp4", "cams", 10).await;
    ledger.mark_all_queued_completed().await.unwrap();
    assert!(!ledger.insert("a.mp4", "cams", 10).await.unwrap());

    assert_eq!(state_of(&ledger, "a.mp4", "cams").await, FileState::Completed);
}

// ============================================================================
// Selection queries
// ============================================================================

#[tokio::test]
async fn test_list_new_preserves_discovery_order() {
    let (_pool, ledger) = setup().await;

    for name in ["c.bin", "a.bin", "b.bin"] {
        ledger.insert(name, "cams", 1).await.unwrap();
    }

    let names: Vec<String> = ledger
        .list_new()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.path)
        .collect();
    assert_eq!(names, vec!["c.bin", "a.bin", "b.bin"]);
}

#[tokio::test]
async fn test_has_new_and_count_queued_or_failed() {
    let (_pool, ledger) = setup().await;

    assert!(!ledger.has_new().await.unwrap());
    assert_eq!(ledger.count_queued_or_failed().await.unwrap(), 0);

    ledger.insert("new.bin", "cams", 1).await.unwrap();
    insert_queued(&ledger, "queued.bin", "cams", 1).await;
    assert!(ledger.has_new().await.unwrap());
    assert_eq!(ledger.count_queued_or_failed().await.unwrap(), 1);

    ledger.mark_all_queued_failed().await.unwrap();
    insert_queued(&ledger, "queued2.bin", "cams", 1).await;
    assert_eq!(ledger.count_queued_or_failed().await.unwrap(), 2);
}

// ============================================================================
// Admission outcomes
// ============================================================================

#[tokio::test]
async fn test_mark_queued_records_staging_path() {
    let (_pool, ledger) = setup().await;

    let staging = insert_queued(&ledger, "2024/a.mp4", "cams", 10).await;
    let record = ledger.lookup("2024/a.mp4", "cams").await.unwrap().unwrap();
    assert_eq!(record.state, FileState::Queued);
    assert_eq!(record.staging_path, Some(staging));
    assert!(ledger.list_new().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_skipped_is_terminal() {
    let (_pool, ledger) = setup().await;

    ledger.insert("huge.bin", "cams", 2000).await.unwrap();
    ledger.mark_skipped("huge.bin", "cams").await.unwrap();
    assert_eq!(state_of(&ledger, "huge.bin", "cams").await, FileState::Skipped);

    // Neither admission nor bulk transitions move a skipped record
    ledger
        .mark_queued("huge.bin", "cams", Path::new("/staging/cams/huge.bin"))
        .await
        .unwrap();
    ledger.mark_all_queued_completed().await.unwrap();
    ledger.mark_all_failed_completed().await.unwrap();
    assert_eq!(state_of(&ledger, "huge.bin", "cams").await, FileState::Skipped);
    assert!(!ledger.has_new().await.unwrap());
}

// ============================================================================
// Bulk transfer transitions
// ============================================================================

#[tokio::test]
async fn test_failed_transfer_then_successful_retry() {
    let (_pool, ledger) = setup().await;

    insert_queued(&ledger, "a.bin", "cams", 1).await;
    insert_queued(&ledger, "b.bin", "cams", 1).await;
    ledger.insert("c.bin", "cams", 1).await.unwrap();

    assert_eq!(ledger.mark_all_queued_failed().await.unwrap(), 2);
    let failed: Vec<String> = ledger
        .list_failed()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.path)
        .collect();
    assert_eq!(failed, vec!["a.bin", "b.bin"]);

    assert_eq!(ledger.mark_all_failed_completed().await.unwrap(), 2);
    for path in ["a.bin", "b.bin"] {
        let record = ledger.lookup(path, "cams").await.unwrap().unwrap();
        assert_eq!(record.state, FileState::Completed);
        assert!(record.synced_at.is_some());
    }
    // Untouched by transfer transitions
    assert_eq!(state_of(&ledger, "c.bin", "cams").await, FileState::New);
}

#[tokio::test]
async fn test_mark_all_queued_completed_only_moves_queued() {
    let (_pool, ledger) = setup().await;

    insert_queued(&ledger, "a.bin", "cams", 1).await;
    ledger.mark_all_queued_failed().await.unwrap();
    insert_queued(&ledger, "b.bin", "cams", 1).await;

    assert_eq!(ledger.mark_all_queued_completed().await.unwrap(), 1);
    assert_eq!(state_of(&ledger, "a.bin", "cams").await, FileState::Failed);
    assert_eq!(state_of(&ledger, "b.bin", "cams").await, FileState::Completed);
}

#[tokio::test]
async fn test_bulk_transitions_on_empty_ledger() {
    let (_pool, ledger) = setup().await;

    assert_eq!(ledger.mark_all_queued_completed().await.unwrap(), 0);
    assert_eq!(ledger.mark_all_failed_completed().await.unwrap(), 0);
    assert_eq!(ledger.mark_all_queued_failed().await.unwrap(), 0);
}

// ============================================================================
// Usage and expiry
// ============================================================================

#[tokio::test]
async fn test_current_completed_usage_counts_only_completed() {
    let (_pool, ledger) = setup().await;

    assert_eq!(ledger.current_completed_usage().await.unwrap(), 0);

    insert_queued(&ledger, "a.bin", "cams", 300).await;
    insert_queued(&ledger, "b.bin", "cams", 200).await;
    ledger.mark_all_queued_completed().await.unwrap();
    insert_queued(&ledger, "c.bin", "cams", 1000).await;
    ledger.insert("d.bin", "cams", 5000).await.unwrap();

    assert_eq!(ledger.current_completed_usage().await.unwrap(), 500);
}

#[tokio::test]
async fn test_expiry_respects_retention_window() {
    let (pool, ledger) = setup().await;

    let staging = insert_queued(&ledger, "a.bin", "cams", 1).await;
    ledger.mark_all_queued_completed().await.unwrap();

    // Just synced: nothing is old enough
    assert!(ledger
        .list_expired_completed(Duration::from_secs(3600))
        .await
        .unwrap()
        .is_empty());

    backdate_synced(&pool, 1800).await;
    assert!(ledger
        .list_expired_completed(Duration::from_secs(3600))
        .await
        .unwrap()
        .is_empty());

    backdate_synced(&pool, 7200).await;
    let expired = ledger
        .list_expired_completed(Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(expired, vec![staging]);
}

#[tokio::test]
async fn test_mark_deleted_frees_quota_and_keeps_history() {
    let (pool, ledger) = setup().await;

    let staging = insert_queued(&ledger, "a.bin", "cams", 700).await;
    ledger.mark_all_queued_completed().await.unwrap();
    backdate_synced(&pool, 100).await;
    assert_eq!(ledger.current_completed_usage().await.unwrap(), 700);

    ledger.mark_deleted(&staging).await.unwrap();

    let record = ledger.lookup("a.bin", "cams").await.unwrap().unwrap();
    assert_eq!(record.state, FileState::Deleted);
    assert_eq!(record.staging_path, Some(staging));
    assert_eq!(ledger.current_completed_usage().await.unwrap(), 0);
    assert!(ledger
        .list_expired_completed(Duration::from_secs(0))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_mark_deleted_ignores_non_completed() {
    let (_pool, ledger) = setup().await;

    let staging = insert_queued(&ledger, "a.bin", "cams", 1).await;
    ledger.mark_deleted(&staging).await.unwrap();
    assert_eq!(state_of(&ledger, "a.bin", "cams").await, FileState::Queued);
}

#[tokio::test]
async fn test_count_by_state() {
    let (_pool, ledger) = setup().await;

    ledger.insert("new.bin", "cams", 1).await.unwrap();
    ledger.insert("skip.bin", "cams", 1).await.unwrap();
    ledger.mark_skipped("skip.bin", "cams").await.unwrap();
    insert_queued(&ledger, "q1.bin", "cams", 1).await;
    insert_queued(&ledger, "q2.bin", "cams", 1).await;

    let counts = ledger.count_by_state().await.unwrap();
    assert_eq!(counts.get(&FileState::New), Some(&1));
    assert_eq!(counts.get(&FileState::Skipped), Some(&1));
    assert_eq!(counts.get(&FileState::Queued), Some(&2));
    assert_eq!(counts.get(&FileState::Completed), None);
}
