//! Protocol tests for the reference-counted mount coordinator, run
//! against an in-memory transport so no broker or agent is required.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use common::message::{
    BackupTarget, JobRef, MountAction, MountRequest, MountResponse, RequestContext,
    ResponseStatus, TargetKind, TargetStatus,
};
use common::rpc::{MountTransport, RpcError};
use coordinator::database::Database;
use coordinator::{CoordinatorError, HostLock, LedgerEntry, MountCoordinator};

const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Scripted transport: replies success unless a failure is queued, and
/// records every request it sees.
#[derive(Default)]
struct FakeTransport {
    calls: Mutex<Vec<MountRequest>>,
    failures: Mutex<VecDeque<RpcError>>,
}

impl FakeTransport {
    fn queue_failure(&self, error: RpcError) {
        self.failures.lock().unwrap().push_back(error);
    }

    fn calls(&self) -> Vec<MountRequest> {
        self.calls.lock().unwrap().clone()
    }

    fn unmount_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|r| r.action == MountAction::Unmount)
            .count()
    }
}

#[async_trait]
impl MountTransport for FakeTransport {
    async fn call(&self, request: &MountRequest) -> Result<MountResponse, RpcError> {
        self.calls.lock().unwrap().push(request.clone());

        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        Ok(MountResponse::success(
            format!("{} ok", request.action),
            Some(request.backup_target.filesystem_export_mount_path.clone()),
        ))
    }
}

async fn setup_test_db() -> Database {
    let db_url = url::Url::parse("sqlite::memory:").unwrap();
    Database::connect(&db_url).await.unwrap()
}

fn request(job_id: i64, target: &str, mount_path: &str) -> MountRequest {
    MountRequest {
        context: RequestContext::default(),
        token: "tok".into(),
        job: JobRef {
            id: job_id,
            action: None,
        },
        host: "h1".into(),
        action: MountAction::Mount,
        backup_target: BackupTarget {
            id: target.into(),
            kind: TargetKind::S3,
            filesystem_export: None,
            filesystem_export_mount_path: mount_path.into(),
            secret_ref: Some(format!("secret://backups/{target}")),
            nfs_mount_opts: None,
            status: TargetStatus::Available,
            deleted: false,
        },
    }
}

#[tokio::test]
async fn single_mount_records_binding() {
    let db = setup_test_db().await;
    let lock_dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::default());
    let coordinator =
        MountCoordinator::new(db.clone(), lock_dir.path(), transport.clone(), LOCK_TIMEOUT);

    let response = coordinator.mount(&request(1001, "tgt-A", "/m/A")).await.unwrap();

    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(response.mount_path.as_deref(), Some("/m/A"));
    assert_eq!(LedgerEntry::count_active("tgt-A", "h1", &db).await.unwrap(), 1);
    assert_eq!(transport.calls().len(), 1);

    let entry = coordinator.status(1001, "tgt-A", "h1").await.unwrap().unwrap();
    assert!(entry.mounted);
    assert_eq!(entry.mount_path.as_deref(), Some("/m/A"));
}

#[tokio::test]
async fn shared_mount_released_in_order_unmounts_on_last() {
    let db = setup_test_db().await;
    let lock_dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::default());
    let coordinator =
        MountCoordinator::new(db.clone(), lock_dir.path(), transport.clone(), LOCK_TIMEOUT);

    for job_id in [1001, 1002, 1003] {
        coordinator.mount(&request(job_id, "tgt-A", "/m/A")).await.unwrap();
    }
    assert_eq!(LedgerEntry::count_active("tgt-A", "h1", &db).await.unwrap(), 3);

    let first = coordinator.unmount(&request(1001, "tgt-A", "/m/A")).await.unwrap();
    assert!(!first.physically_unmounted);
    assert_eq!(first.remaining, 2);

    let second = coordinator.unmount(&request(1002, "tgt-A", "/m/A")).await.unwrap();
    assert!(!second.physically_unmounted);
    assert_eq!(second.remaining, 1);

    // No unmount RPC so far: the first two releases are ledger-only.
    assert_eq!(transport.unmount_calls(), 0);

    let last = coordinator.unmount(&request(1003, "tgt-A", "/m/A")).await.unwrap();
    assert!(last.physically_unmounted);
    assert_eq!(last.remaining, 0);
    assert_eq!(transport.unmount_calls(), 1);

    assert_eq!(LedgerEntry::count_active("tgt-A", "h1", &db).await.unwrap(), 0);
}

#[tokio::test]
async fn shared_mount_released_out_of_order() {
    let db = setup_test_db().await;
    let lock_dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::default());
    let coordinator =
        MountCoordinator::new(db.clone(), lock_dir.path(), transport.clone(), LOCK_TIMEOUT);

    coordinator.mount(&request(2001, "tgt-B", "/m/B")).await.unwrap();
    coordinator.mount(&request(2002, "tgt-B", "/m/B")).await.unwrap();

    let first = coordinator.unmount(&request(2002, "tgt-B", "/m/B")).await.unwrap();
    assert!(!first.physically_unmounted);
    assert_eq!(first.remaining, 1);
    assert_eq!(transport.unmount_calls(), 0);

    let released = coordinator.status(2002, "tgt-B", "h1").await.unwrap().unwrap();
    assert!(!released.mounted);

    let second = coordinator.unmount(&request(2001, "tgt-B", "/m/B")).await.unwrap();
    assert!(second.physically_unmounted);
    assert_eq!(second.remaining, 0);
    assert_eq!(transport.unmount_calls(), 1);

    let survivor = coordinator.status(2001, "tgt-B", "h1").await.unwrap().unwrap();
    assert!(!survivor.mounted);
}

#[tokio::test]
async fn unmount_without_active_binding_is_a_noop() {
    let db = setup_test_db().await;
    let lock_dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::default());
    let coordinator = MountCoordinator::new(db, lock_dir.path(), transport.clone(), LOCK_TIMEOUT);

    let outcome = coordinator.unmount(&request(999, "tgt-A", "/m/A")).await.unwrap();
    assert!(!outcome.physically_unmounted);
    assert_eq!(outcome.remaining, 0);
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn unmount_by_job_without_binding_leaves_other_holders_alone() {
    let db = setup_test_db().await;
    let lock_dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::default());
    let coordinator =
        MountCoordinator::new(db.clone(), lock_dir.path(), transport.clone(), LOCK_TIMEOUT);

    coordinator.mount(&request(1001, "tgt-A", "/m/A")).await.unwrap();

    // A job that never mounted releases: nothing happens to the holder.
    let outcome = coordinator.unmount(&request(4242, "tgt-A", "/m/A")).await.unwrap();
    assert!(!outcome.physically_unmounted);
    assert_eq!(outcome.remaining, 1);
    assert_eq!(transport.unmount_calls(), 0);
    assert_eq!(LedgerEntry::count_active("tgt-A", "h1", &db).await.unwrap(), 1);
}

#[tokio::test]
async fn lost_reply_writes_error_and_retry_converges() {
    let db = setup_test_db().await;
    let lock_dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::default());
    let coordinator =
        MountCoordinator::new(db.clone(), lock_dir.path(), transport.clone(), LOCK_TIMEOUT);

    transport.queue_failure(RpcError::Timeout(Duration::from_secs(60)));

    let req = request(1001, "tgt-A", "/m/A");
    let err = coordinator.mount(&req).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Transport(RpcError::Timeout(_))));

    // The failure is on the ledger and the binding is not active.
    let entry = coordinator.status(1001, "tgt-A", "h1").await.unwrap().unwrap();
    assert!(!entry.mounted);
    assert!(entry.error_msg.is_some());
    assert_eq!(LedgerEntry::count_active("tgt-A", "h1", &db).await.unwrap(), 0);

    // The agent may have mounted anyway; the retry hits its idempotent
    // path and the ledger converges on mounted.
    let response = coordinator.mount(&req).await.unwrap();
    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(LedgerEntry::count_active("tgt-A", "h1", &db).await.unwrap(), 1);
}

#[tokio::test]
async fn lock_timeout_leaves_ledger_untouched() {
    let db = setup_test_db().await;
    let lock_dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::default());
    let coordinator = MountCoordinator::new(
        db.clone(),
        lock_dir.path(),
        transport.clone(),
        Duration::from_millis(200),
    );

    // Another process holds the host lock past our budget.
    let holder = HostLock::new(lock_dir.path());
    let _guard = holder.acquire(Duration::from_secs(1)).await.unwrap();

    let err = coordinator.mount(&request(1001, "tgt-A", "/m/A")).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Lock(_)));

    assert!(coordinator.status(1001, "tgt-A", "h1").await.unwrap().is_none());
    assert!(transport.calls().is_empty());
}

#[tokio::test]
async fn with_mount_releases_on_success_and_on_body_error() {
    let db = setup_test_db().await;
    let lock_dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::default());
    let coordinator =
        MountCoordinator::new(db.clone(), lock_dir.path(), transport.clone(), LOCK_TIMEOUT);

    let req = request(1001, "tgt-A", "/m/A");

    let out: Result<String, CoordinatorError> = coordinator
        .with_mount(&req, |path| async move {
            Ok(path.display().to_string())
        })
        .await;
    assert_eq!(out.unwrap(), "/m/A");
    assert_eq!(LedgerEntry::count_active("tgt-A", "h1", &db).await.unwrap(), 0);
    assert_eq!(transport.unmount_calls(), 1);

    // The binding is released on the error path too, and the body's
    // error is what the caller sees.
    let out: Result<(), CoordinatorError> = coordinator
        .with_mount(&req, |_path| async move {
            Err(CoordinatorError::MountRefused("backup exploded".into()))
        })
        .await;
    assert!(matches!(out, Err(CoordinatorError::MountRefused(_))));
    assert_eq!(LedgerEntry::count_active("tgt-A", "h1", &db).await.unwrap(), 0);
    assert_eq!(transport.unmount_calls(), 2);
}

#[tokio::test]
async fn repeated_unmount_is_idempotent() {
    let db = setup_test_db().await;
    let lock_dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(FakeTransport::default());
    let coordinator =
        MountCoordinator::new(db.clone(), lock_dir.path(), transport.clone(), LOCK_TIMEOUT);

    coordinator.mount(&request(1001, "tgt-A", "/m/A")).await.unwrap();

    let first = coordinator.unmount(&request(1001, "tgt-A", "/m/A")).await.unwrap();
    assert!(first.physically_unmounted);

    // Running the same release again finds nothing to do and performs no
    // second physical unmount.
    let second = coordinator.unmount(&request(1001, "tgt-A", "/m/A")).await.unwrap();
    assert!(!second.physically_unmounted);
    assert_eq!(second.remaining, 0);
    assert_eq!(transport.unmount_calls(), 1);
}
