use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::message::{
    LedgerKey, MountAction, MountRequest, MountResponse, ResponseStatus, ValidationError,
};
use common::rpc::{MountTransport, RpcError};

use crate::database::models::LedgerEntry;
use crate::database::{Database, LedgerAction};
use crate::lock::{HostLock, LockError};

/// Outcome of an unmount decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmountOutcome {
    pub status: ResponseStatus,
    /// True only when this release transitioned the reference count from
    /// one to zero and the kernel unmount was performed.
    pub physically_unmounted: bool,
    /// Live bindings still holding the target mounted on the host.
    pub remaining: i64,
    pub message: String,
}

/// Client-side mount coordinator. Wraps the host lock, the ledger and the
/// RPC transport into the reference-counted mount/unmount protocol: mount
/// at most once per (target, host), physically unmount exactly when the
/// last binding releases.
pub struct MountCoordinator<T> {
    db: Database,
    lock: HostLock,
    transport: T,
    lock_timeout: Duration,
}

impl<T: MountTransport> MountCoordinator<T> {
    pub fn new(
        db: Database,
        lock_dir: impl AsRef<Path>,
        transport: T,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            db,
            lock: HostLock::new(lock_dir),
            transport,
            lock_timeout,
        }
    }

    /// Request a mount for one (job, target, host) binding.
    ///
    /// Under the host lock: record the pending row, call the node agent,
    /// then record the outcome. The agent is idempotent, so a retry after
    /// a lost reply converges on the already-mounted state.
    pub async fn mount(&self, request: &MountRequest) -> Result<MountResponse, CoordinatorError> {
        request.validate()?;
        let key = request.key();

        let _guard = self.lock.acquire(self.lock_timeout).await?;

        let request_blob = serde_json::to_string(request).ok();
        LedgerEntry::upsert_pending(&key, LedgerAction::Mount, request_blob.as_deref(), &self.db)
            .await?;

        tracing::info!(
            job_id = key.job_id,
            target_id = %key.backup_target_id,
            host = %key.host,
            "requesting mount"
        );

        let response = match self.transport.call(request).await {
            Ok(response) => response,
            Err(e) => {
                LedgerEntry::mark_error(&key, &e.to_string(), None, &self.db).await?;
                return Err(CoordinatorError::Transport(e));
            }
        };

        let response_blob = serde_json::to_string(&response).ok();
        match response.status {
            ResponseStatus::Success => {
                LedgerEntry::mark_success(
                    &key,
                    response.mount_path.as_deref(),
                    response_blob.as_deref(),
                    true,
                    response.success_msg.as_deref(),
                    &self.db,
                )
                .await?;
            }
            ResponseStatus::Error => {
                let msg = response.error_msg.as_deref().unwrap_or("mount failed");
                LedgerEntry::mark_error(&key, msg, response_blob.as_deref(), &self.db).await?;
            }
        }

        Ok(response)
    }

    /// Release one binding. The physical unmount happens only on the
    /// release that takes the reference count from one to zero; earlier
    /// releases are ledger-only.
    pub async fn unmount(&self, request: &MountRequest) -> Result<UnmountOutcome, CoordinatorError> {
        request.validate()?;
        let key = request.key();
        let target_id = &key.backup_target_id;

        let _guard = self.lock.acquire(self.lock_timeout).await?;

        let active = LedgerEntry::count_active(target_id, &key.host, &self.db).await?;
        let active_jobs = LedgerEntry::active_jobs(target_id, &key.host, &self.db).await?;
        let requester_active = active_jobs.contains(&key.job_id);

        tracing::info!(
            job_id = key.job_id,
            target_id = %target_id,
            host = %key.host,
            active,
            "requesting unmount"
        );

        if active == 0 {
            return Ok(UnmountOutcome {
                status: ResponseStatus::Success,
                physically_unmounted: false,
                remaining: 0,
                message: format!("target {target_id} has no active bindings on {}", key.host),
            });
        }

        if !requester_active {
            // Some other binding holds the mount; this job has nothing
            // live to release.
            return Ok(UnmountOutcome {
                status: ResponseStatus::Success,
                physically_unmounted: false,
                remaining: active,
                message: format!("job {} holds no active binding for {target_id}", key.job_id),
            });
        }

        if active > 1 {
            LedgerEntry::mark_success(
                &key,
                None,
                None,
                false,
                Some("released; target still in use"),
                &self.db,
            )
            .await?;

            return Ok(UnmountOutcome {
                status: ResponseStatus::Success,
                physically_unmounted: false,
                remaining: active - 1,
                message: format!(
                    "target {target_id} still referenced by {} other job(s)",
                    active - 1
                ),
            });
        }

        // Last binding: drive the physical unmount through the agent.
        let mut unmount_request = request.clone();
        unmount_request.action = MountAction::Unmount;

        let request_blob = serde_json::to_string(&unmount_request).ok();
        LedgerEntry::upsert_pending(
            &key,
            LedgerAction::Unmount,
            request_blob.as_deref(),
            &self.db,
        )
        .await?;

        let response = match self.transport.call(&unmount_request).await {
            Ok(response) => response,
            Err(e) => {
                LedgerEntry::mark_error(&key, &e.to_string(), None, &self.db).await?;
                return Err(CoordinatorError::Transport(e));
            }
        };

        let response_blob = serde_json::to_string(&response).ok();
        match response.status {
            ResponseStatus::Success => {
                LedgerEntry::mark_success(
                    &key,
                    None,
                    response_blob.as_deref(),
                    false,
                    response.success_msg.as_deref(),
                    &self.db,
                )
                .await?;

                Ok(UnmountOutcome {
                    status: ResponseStatus::Success,
                    physically_unmounted: true,
                    remaining: 0,
                    message: format!("target {target_id} unmounted from {}", key.host),
                })
            }
            ResponseStatus::Error => {
                let msg = response.error_msg.as_deref().unwrap_or("unmount failed");
                LedgerEntry::mark_error(&key, msg, response_blob.as_deref(), &self.db).await?;

                // Kernel state unknown; the row stays mounted so a retry
                // repeats the decision with an accurate count.
                Ok(UnmountOutcome {
                    status: ResponseStatus::Error,
                    physically_unmounted: false,
                    remaining: active,
                    message: msg.to_string(),
                })
            }
        }
    }

    /// Scoped mount: acquire, run the body with the mount path, release on
    /// every exit path. The body's error wins over a release error.
    pub async fn with_mount<F, Fut, R, E>(&self, request: &MountRequest, body: F) -> Result<R, E>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<CoordinatorError>,
    {
        let response = self.mount(request).await.map_err(E::from)?;
        if !response.is_success() {
            let msg = response
                .error_msg
                .unwrap_or_else(|| "mount failed".to_string());
            return Err(E::from(CoordinatorError::MountRefused(msg)));
        }

        let mount_path = response
            .mount_path
            .clone()
            .unwrap_or_else(|| request.backup_target.filesystem_export_mount_path.clone());

        let outcome = body(PathBuf::from(mount_path)).await;

        match self.unmount(request).await {
            Ok(_) => outcome,
            Err(release_err) => match outcome {
                // Body failed first; its error is the one the caller
                // needs. The stuck binding stays visible in the ledger.
                Err(body_err) => {
                    tracing::error!(
                        job_id = request.job.id,
                        target_id = %request.backup_target.id,
                        "release failed after body error: {}",
                        release_err
                    );
                    Err(body_err)
                }
                Ok(_) => Err(E::from(release_err)),
            },
        }
    }

    pub async fn status(
        &self,
        job_id: i64,
        backup_target_id: &str,
        host: &str,
    ) -> Result<Option<LedgerEntry>, CoordinatorError> {
        let key = LedgerKey {
            job_id,
            backup_target_id: backup_target_id.to_string(),
            host: host.to_string(),
        };
        Ok(LedgerEntry::get_by_key(&key, &self.db).await?)
    }

    pub async fn list_active(
        &self,
        host: Option<&str>,
        backup_target_id: Option<&str>,
    ) -> Result<Vec<LedgerEntry>, CoordinatorError> {
        Ok(LedgerEntry::list_active(host, backup_target_id, &self.db).await?)
    }

    pub async fn history(
        &self,
        backup_target_id: &str,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, CoordinatorError> {
        Ok(LedgerEntry::history_by_target(backup_target_id, limit, &self.db).await?)
    }

    /// Operator retirement of a binding. Serialized with the mount
    /// protocol so a concurrent decision never counts a half-deleted row.
    pub async fn soft_delete(
        &self,
        job_id: i64,
        backup_target_id: &str,
        host: &str,
    ) -> Result<bool, CoordinatorError> {
        let _guard = self.lock.acquire(self.lock_timeout).await?;

        let key = LedgerKey {
            job_id,
            backup_target_id: backup_target_id.to_string(),
            host: host.to_string(),
        };
        Ok(LedgerEntry::soft_delete(&key, &self.db).await?)
    }
}

impl<T> std::fmt::Debug for MountCoordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountCoordinator")
            .field("lock", &self.lock)
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("ledger error: {0}")]
    Ledger(#[from] sqlx::Error),

    #[error("transport error: {0}")]
    Transport(#[from] RpcError),

    #[error("mount refused by agent: {0}")]
    MountRefused(String),
}
