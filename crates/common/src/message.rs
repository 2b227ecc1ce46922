use serde::{Deserialize, Serialize};

/// Caller identity attached to every request. Opaque to the core;
/// carried for auditing and forwarded to the secret store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub project_id: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    S3,
    Nfs,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::S3 => write!(f, "s3"),
            Self::Nfs => write!(f, "nfs"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Available,
    Unavailable,
}

/// An addressable remote storage endpoint intended to receive backup data.
///
/// `filesystem_export_mount_path` is authoritative for the absolute mount
/// point; the core never rewrites or computes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupTarget {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TargetKind,
    /// `<host>:/<path>` export string. Required for NFS, ignored for S3.
    pub filesystem_export: Option<String>,
    /// Absolute path where the target is exposed on the host.
    pub filesystem_export_mount_path: String,
    /// Opaque URI resolvable against the secret store. Required for S3.
    pub secret_ref: Option<String>,
    /// Comma-separated mount options passed through to the NFS mount.
    pub nfs_mount_opts: Option<String>,
    pub status: TargetStatus,
    #[serde(default)]
    pub deleted: bool,
}

/// Job identity. The id is a signed integer; a JSON string here fails
/// deserialization outright.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRef {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MountAction {
    Mount,
    Unmount,
}

impl std::fmt::Display for MountAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mount => write!(f, "mount"),
            Self::Unmount => write!(f, "unmount"),
        }
    }
}

/// A mount or unmount request for one (job, target, host) binding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountRequest {
    #[serde(default)]
    pub context: RequestContext,
    pub token: String,
    pub job: JobRef,
    pub host: String,
    pub action: MountAction,
    pub backup_target: BackupTarget,
}

impl MountRequest {
    /// The logical binding key for this request.
    pub fn key(&self) -> LedgerKey {
        LedgerKey {
            job_id: self.job.id,
            backup_target_id: self.backup_target.id.clone(),
            host: self.host.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.trim().is_empty() {
            return Err(ValidationError::EmptyHost);
        }

        let target = &self.backup_target;
        if target.filesystem_export_mount_path.trim().is_empty() {
            return Err(ValidationError::MissingMountPath(target.id.clone()));
        }
        if !target.filesystem_export_mount_path.starts_with('/') {
            return Err(ValidationError::RelativeMountPath(
                target.filesystem_export_mount_path.clone(),
            ));
        }

        match target.kind {
            TargetKind::S3 => {
                if target.secret_ref.as_deref().map_or(true, str::is_empty) {
                    return Err(ValidationError::MissingSecretRef(target.id.clone()));
                }
            }
            TargetKind::Nfs => {
                if target
                    .filesystem_export
                    .as_deref()
                    .map_or(true, str::is_empty)
                {
                    return Err(ValidationError::MissingExport(target.id.clone()));
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountResponse {
    pub status: ResponseStatus,
    pub success_msg: Option<String>,
    pub error_msg: Option<String>,
    pub mount_path: Option<String>,
}

impl MountResponse {
    pub fn success(msg: impl Into<String>, mount_path: Option<String>) -> Self {
        Self {
            status: ResponseStatus::Success,
            success_msg: Some(msg.into()),
            error_msg: None,
            mount_path,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            success_msg: None,
            error_msg: Some(msg.into()),
            mount_path: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

/// Logical key identifying one (job, target, host) binding in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct LedgerKey {
    pub job_id: i64,
    pub backup_target_id: String,
    pub host: String,
}

impl std::fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "job={} target={} host={}",
            self.job_id, self.backup_target_id, self.host
        )
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("host must not be empty")]
    EmptyHost,

    #[error("target {0}: filesystem_export_mount_path is required")]
    MissingMountPath(String),

    #[error("mount path must be absolute: {0}")]
    RelativeMountPath(String),

    #[error("s3 target {0} requires a secret_ref")]
    MissingSecretRef(String),

    #[error("nfs target {0} requires a filesystem_export")]
    MissingExport(String),
}
