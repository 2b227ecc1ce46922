//! Server-side mount execution.
//!
//! Dispatches a validated request to the right mechanism: S3 targets get
//! a detached FUSE helper through the process registry, NFS targets go
//! through the privileged mount helper. Both directions are idempotent
//! against the kernel mount table, so broker redeliveries and client
//! retries are absorbed here.

mod env;

pub use env::{fuse_environment, redacted_env, REDACTED_ENV_KEYS};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::message::{BackupTarget, MountRequest, TargetKind};

use crate::mountinfo;
use crate::registry::{ProcessRegistry, RegistryError};
use crate::secrets::{SecretClient, SecretError};

const UMOUNT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Fallback chain for stubborn unmounts: plain, then lazy, then force.
const UMOUNT_ATTEMPTS: &[&[&str]] = &[&[], &["-l"], &["-f"]];

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to prepare mount point {0}: {1}")]
    MountPoint(PathBuf, #[source] std::io::Error),

    #[error("mount of {export} at {mount_path} failed: {detail}")]
    MountFailed {
        export: String,
        mount_path: PathBuf,
        detail: String,
    },

    #[error("failed to unmount {0}: {1}")]
    UnmountFailed(PathBuf, String),

    #[error("failed to read mount table: {0}")]
    MountTable(#[source] std::io::Error),

    #[error("failed to run {0}: {1}")]
    Helper(String, #[source] std::io::Error),
}

pub struct MountExecutor {
    registry: Arc<ProcessRegistry>,
    secrets: SecretClient,
    mount_helper: PathBuf,
    mount_helper_conf: Option<PathBuf>,
}

impl MountExecutor {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        secrets: SecretClient,
        mount_helper: impl Into<PathBuf>,
        mount_helper_conf: Option<PathBuf>,
    ) -> Self {
        Self {
            registry,
            secrets,
            mount_helper: mount_helper.into(),
            mount_helper_conf,
        }
    }

    /// Mount the request's target. Returns the mount path on success.
    pub async fn mount(&self, request: &MountRequest) -> Result<PathBuf, ExecutorError> {
        let target = &request.backup_target;
        let mount_path = PathBuf::from(&target.filesystem_export_mount_path);

        match target.kind {
            TargetKind::S3 => self.mount_s3(target, &request.token, &mount_path).await?,
            TargetKind::Nfs => self.mount_nfs(target, &mount_path).await?,
        }

        Ok(mount_path)
    }

    /// Unmount the request's target. Unmounting a path the kernel does
    /// not have mounted is success.
    pub async fn unmount(&self, request: &MountRequest) -> Result<(), ExecutorError> {
        let target = &request.backup_target;
        let mount_path = PathBuf::from(&target.filesystem_export_mount_path);

        if target.kind == TargetKind::S3 {
            // The helper holds the mount; it goes first.
            self.registry.kill(&target.id, false).await?;
        }

        if !mountinfo::is_mount_point(&mount_path).map_err(ExecutorError::MountTable)? {
            tracing::info!(
                target_id = %target.id,
                mount_path = %mount_path.display(),
                "path already unmounted"
            );
            return Ok(());
        }

        self.umount_with_fallback(&mount_path).await
    }

    async fn mount_s3(
        &self,
        target: &BackupTarget,
        token: &str,
        mount_path: &Path,
    ) -> Result<(), ExecutorError> {
        if mountinfo::is_mount_point(mount_path).map_err(ExecutorError::MountTable)? {
            tracing::info!(
                target_id = %target.id,
                mount_path = %mount_path.display(),
                "target already mounted"
            );
            return Ok(());
        }

        // secret_ref presence is guaranteed by request validation.
        let secret_ref = target.secret_ref.as_deref().unwrap_or_default();
        let credentials = self.secrets.fetch(secret_ref, token).await?;

        let helper_env = fuse_environment(target, &credentials, mount_path);
        tracing::info!(
            target_id = %target.id,
            mount_path = %mount_path.display(),
            env = ?redacted_env(&helper_env),
            "starting FUSE helper"
        );

        ensure_mount_dir(mount_path)?;
        self.registry
            .spawn(&target.id, mount_path, &helper_env)
            .await?;

        Ok(())
    }

    async fn mount_nfs(
        &self,
        target: &BackupTarget,
        mount_path: &Path,
    ) -> Result<(), ExecutorError> {
        if mountinfo::is_mount_point(mount_path).map_err(ExecutorError::MountTable)? {
            tracing::info!(
                target_id = %target.id,
                mount_path = %mount_path.display(),
                "target already mounted"
            );
            return Ok(());
        }

        // filesystem_export presence is guaranteed by request validation.
        let export = target.filesystem_export.as_deref().unwrap_or_default();
        ensure_mount_dir(mount_path)?;

        let mut command = tokio::process::Command::new(&self.mount_helper);
        command.arg("-t").arg("nfs");
        if let Some(opts) = target.nfs_mount_opts.as_deref().filter(|o| !o.is_empty()) {
            command.arg("-o").arg(opts);
        }
        command.arg(export).arg(mount_path);
        if let Some(conf) = &self.mount_helper_conf {
            command.env("DMS_MOUNT_HELPER_CONF", conf);
        }

        tracing::info!(
            target_id = %target.id,
            export,
            mount_path = %mount_path.display(),
            "mounting nfs export"
        );

        let output = command
            .output()
            .await
            .map_err(|e| ExecutorError::Helper(self.mount_helper.display().to_string(), e))?;

        if !output.status.success() {
            return Err(ExecutorError::MountFailed {
                export: export.to_string(),
                mount_path: mount_path.to_path_buf(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        // The helper exiting zero is not proof; the kernel is.
        if !mountinfo::is_mount_point(mount_path).map_err(ExecutorError::MountTable)? {
            return Err(ExecutorError::MountFailed {
                export: export.to_string(),
                mount_path: mount_path.to_path_buf(),
                detail: "mount helper exited cleanly but the path is not a mount point".into(),
            });
        }

        Ok(())
    }

    async fn umount_with_fallback(&self, mount_path: &Path) -> Result<(), ExecutorError> {
        let mut last_detail = String::new();

        for (attempt, extra_args) in UMOUNT_ATTEMPTS.iter().enumerate() {
            if attempt > 0 {
                tokio::time::sleep(UMOUNT_RETRY_DELAY).await;
            }

            let output = tokio::process::Command::new("umount")
                .args(*extra_args)
                .arg(mount_path)
                .output()
                .await
                .map_err(|e| ExecutorError::Helper("umount".into(), e))?;

            if !mountinfo::is_mount_point(mount_path).map_err(ExecutorError::MountTable)? {
                tracing::info!(mount_path = %mount_path.display(), "unmounted");
                return Ok(());
            }

            last_detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::warn!(
                mount_path = %mount_path.display(),
                attempt = attempt + 1,
                detail = %last_detail,
                "umount attempt failed"
            );
        }

        Err(ExecutorError::UnmountFailed(
            mount_path.to_path_buf(),
            last_detail,
        ))
    }
}

impl std::fmt::Debug for MountExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountExecutor")
            .field("registry", &self.registry)
            .field("mount_helper", &self.mount_helper)
            .finish()
    }
}

fn ensure_mount_dir(mount_path: &Path) -> Result<(), ExecutorError> {
    std::fs::create_dir_all(mount_path)
        .map_err(|e| ExecutorError::MountPoint(mount_path.to_path_buf(), e))
}
