//! Integration tests for the mount ledger primitives.

use common::message::LedgerKey;
use coordinator::database::{Database, LedgerAction, LedgerStatus};
use coordinator::LedgerEntry;

/// Create an in-memory test database
async fn setup_test_db() -> Database {
    let db_url = url::Url::parse("sqlite::memory:").unwrap();
    Database::connect(&db_url).await.unwrap()
}

fn key(job_id: i64, target: &str, host: &str) -> LedgerKey {
    LedgerKey {
        job_id,
        backup_target_id: target.to_string(),
        host: host.to_string(),
    }
}

#[tokio::test]
async fn upsert_creates_pending_row() {
    let db = setup_test_db().await;
    let k = key(1001, "tgt-A", "h1");

    let entry = LedgerEntry::upsert_pending(&k, LedgerAction::Mount, Some("{}"), &db)
        .await
        .unwrap();

    assert_eq!(entry.job_id, 1001);
    assert_eq!(entry.backup_target_id, "tgt-A");
    assert_eq!(entry.host, "h1");
    assert_eq!(entry.status_last, LedgerStatus::Pending);
    assert_eq!(entry.action_last, LedgerAction::Mount);
    assert!(!entry.mounted);
    assert!(entry.mount_path.is_none());
    assert!(entry.completed_at.is_none());
    assert!(!entry.deleted);
}

#[tokio::test]
async fn upsert_resets_outcome_but_keeps_mounted_flag() {
    let db = setup_test_db().await;
    let k = key(1001, "tgt-A", "h1");

    LedgerEntry::upsert_pending(&k, LedgerAction::Mount, None, &db)
        .await
        .unwrap();
    LedgerEntry::mark_success(&k, Some("/m/A"), Some("{}"), true, Some("mounted"), &db)
        .await
        .unwrap();

    // A retry of the same binding goes back to pending without losing the
    // last known kernel state.
    let entry = LedgerEntry::upsert_pending(&k, LedgerAction::Mount, Some("{}"), &db)
        .await
        .unwrap();
    assert_eq!(entry.status_last, LedgerStatus::Pending);
    assert!(entry.mounted);
    assert!(entry.success_msg.is_none());
    assert!(entry.response_data.is_none());
    assert!(entry.completed_at.is_none());

    // Still a single row for the key.
    assert_eq!(LedgerEntry::count_active("tgt-A", "h1", &db).await.unwrap(), 1);
}

#[tokio::test]
async fn mark_success_sets_mounted_path_and_completion() {
    let db = setup_test_db().await;
    let k = key(1001, "tgt-A", "h1");

    LedgerEntry::upsert_pending(&k, LedgerAction::Mount, None, &db)
        .await
        .unwrap();
    let updated = LedgerEntry::mark_success(&k, Some("/m/A"), Some("{}"), true, Some("ok"), &db)
        .await
        .unwrap();
    assert!(updated);

    let entry = LedgerEntry::get_by_key(&k, &db).await.unwrap().unwrap();
    assert_eq!(entry.status_last, LedgerStatus::Success);
    assert!(entry.mounted);
    assert_eq!(entry.mount_path.as_deref(), Some("/m/A"));
    assert_eq!(entry.success_msg.as_deref(), Some("ok"));
    assert!(entry.completed_at.is_some());
}

#[tokio::test]
async fn unmount_success_keeps_recorded_mount_path() {
    let db = setup_test_db().await;
    let k = key(1001, "tgt-A", "h1");

    LedgerEntry::upsert_pending(&k, LedgerAction::Mount, None, &db)
        .await
        .unwrap();
    LedgerEntry::mark_success(&k, Some("/m/A"), None, true, None, &db)
        .await
        .unwrap();

    // Ledger-only release passes no path; the historical path survives.
    LedgerEntry::mark_success(&k, None, None, false, Some("released"), &db)
        .await
        .unwrap();

    let entry = LedgerEntry::get_by_key(&k, &db).await.unwrap().unwrap();
    assert!(!entry.mounted);
    assert_eq!(entry.mount_path.as_deref(), Some("/m/A"));
}

#[tokio::test]
async fn mark_error_leaves_mounted_untouched() {
    let db = setup_test_db().await;
    let k = key(1001, "tgt-A", "h1");

    LedgerEntry::upsert_pending(&k, LedgerAction::Mount, None, &db)
        .await
        .unwrap();
    LedgerEntry::mark_success(&k, Some("/m/A"), None, true, None, &db)
        .await
        .unwrap();

    LedgerEntry::mark_error(&k, "umount: target is busy", None, &db)
        .await
        .unwrap();

    let entry = LedgerEntry::get_by_key(&k, &db).await.unwrap().unwrap();
    assert_eq!(entry.status_last, LedgerStatus::Error);
    assert_eq!(entry.error_msg.as_deref(), Some("umount: target is busy"));
    assert!(entry.mounted);
    assert_eq!(LedgerEntry::count_active("tgt-A", "h1", &db).await.unwrap(), 1);
}

#[tokio::test]
async fn count_active_tracks_live_mounted_rows_per_target_and_host() {
    let db = setup_test_db().await;

    for job_id in [1001, 1002, 1003] {
        let k = key(job_id, "tgt-A", "h1");
        LedgerEntry::upsert_pending(&k, LedgerAction::Mount, None, &db)
            .await
            .unwrap();
        LedgerEntry::mark_success(&k, Some("/m/A"), None, true, None, &db)
            .await
            .unwrap();
    }

    // Different host and different target do not count.
    let other_host = key(1001, "tgt-A", "h2");
    LedgerEntry::upsert_pending(&other_host, LedgerAction::Mount, None, &db)
        .await
        .unwrap();
    LedgerEntry::mark_success(&other_host, Some("/m/A"), None, true, None, &db)
        .await
        .unwrap();

    let other_target = key(1001, "tgt-B", "h1");
    LedgerEntry::upsert_pending(&other_target, LedgerAction::Mount, None, &db)
        .await
        .unwrap();

    assert_eq!(LedgerEntry::count_active("tgt-A", "h1", &db).await.unwrap(), 3);
    assert_eq!(LedgerEntry::count_active("tgt-A", "h2", &db).await.unwrap(), 1);
    assert_eq!(LedgerEntry::count_active("tgt-B", "h1", &db).await.unwrap(), 0);
    assert_eq!(
        LedgerEntry::active_jobs("tgt-A", "h1", &db).await.unwrap(),
        vec![1001, 1002, 1003]
    );
}

#[tokio::test]
async fn soft_delete_excludes_from_count_but_keeps_history() {
    let db = setup_test_db().await;
    let k = key(1001, "tgt-A", "h1");

    LedgerEntry::upsert_pending(&k, LedgerAction::Mount, None, &db)
        .await
        .unwrap();
    LedgerEntry::mark_success(&k, Some("/m/A"), None, true, None, &db)
        .await
        .unwrap();
    assert_eq!(LedgerEntry::count_active("tgt-A", "h1", &db).await.unwrap(), 1);

    assert!(LedgerEntry::soft_delete(&k, &db).await.unwrap());
    assert_eq!(LedgerEntry::count_active("tgt-A", "h1", &db).await.unwrap(), 0);
    assert!(LedgerEntry::get_by_key(&k, &db).await.unwrap().is_none());

    // Retained for forensics.
    let history = LedgerEntry::history_by_target("tgt-A", 10, &db).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].deleted);
    assert!(history[0].deleted_at.is_some());

    // Deleting again is a no-op.
    assert!(!LedgerEntry::soft_delete(&k, &db).await.unwrap());
}

#[tokio::test]
async fn list_active_applies_optional_filters() {
    let db = setup_test_db().await;

    for (job_id, target, host) in [(1, "tgt-A", "h1"), (2, "tgt-A", "h2"), (3, "tgt-B", "h1")] {
        let k = key(job_id, target, host);
        LedgerEntry::upsert_pending(&k, LedgerAction::Mount, None, &db)
            .await
            .unwrap();
        LedgerEntry::mark_success(&k, Some("/m/x"), None, true, None, &db)
            .await
            .unwrap();
    }

    assert_eq!(LedgerEntry::list_active(None, None, &db).await.unwrap().len(), 3);
    assert_eq!(
        LedgerEntry::list_active(Some("h1"), None, &db).await.unwrap().len(),
        2
    );
    assert_eq!(
        LedgerEntry::list_active(None, Some("tgt-A"), &db).await.unwrap().len(),
        2
    );
    assert_eq!(
        LedgerEntry::list_active(Some("h2"), Some("tgt-A"), &db)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn history_respects_limit_and_orders_newest_first() {
    let db = setup_test_db().await;

    for job_id in 1..=5 {
        let k = key(job_id, "tgt-A", "h1");
        LedgerEntry::upsert_pending(&k, LedgerAction::Mount, None, &db)
            .await
            .unwrap();
    }

    let history = LedgerEntry::history_by_target("tgt-A", 3, &db).await.unwrap();
    assert_eq!(history.len(), 3);
    // Same-second timestamps fall back to insertion order, newest first.
    assert!(history[0].id > history[1].id);
    assert!(history[1].id > history[2].id);
}
