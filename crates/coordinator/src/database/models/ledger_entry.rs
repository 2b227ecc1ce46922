use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;

use common::message::LedgerKey;

use crate::database::types::{LedgerAction, LedgerStatus};
use crate::database::Database;

const COLUMNS: &str = r#"
    id, job_id, backup_target_id, host, mounted, mount_path,
    action_last, status_last, request_data, response_data,
    error_msg, success_msg, created_at, updated_at, completed_at,
    deleted, deleted_at
"#;

/// One (job, target, host) binding. For a given (target, host) the count
/// of rows with `mounted=true AND deleted=false` is the reference count
/// the coordinator bases its unmount decision on.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LedgerEntry {
    pub id: i64,
    pub job_id: i64,
    pub backup_target_id: String,
    pub host: String,
    pub mounted: bool,
    pub mount_path: Option<String>,
    pub action_last: LedgerAction,
    pub status_last: LedgerStatus,
    pub request_data: Option<String>,
    pub response_data: Option<String>,
    pub error_msg: Option<String>,
    pub success_msg: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
    pub deleted: bool,
    pub deleted_at: Option<OffsetDateTime>,
}

impl LedgerEntry {
    /// Create or reset the live row for a key to pending. An existing
    /// row keeps its `mounted` flag: a retried request must not clobber
    /// the last known kernel state before the outcome is in.
    pub async fn upsert_pending(
        key: &LedgerKey,
        action: LedgerAction,
        request_data: Option<&str>,
        db: &Database,
    ) -> Result<LedgerEntry, sqlx::Error> {
        let existing = Self::get_by_key(key, db).await?;

        match existing {
            Some(entry) => {
                sqlx::query(
                    r#"
                    UPDATE mount_ledger
                    SET action_last = ?1, status_last = ?2, request_data = ?3,
                        response_data = NULL, error_msg = NULL, success_msg = NULL,
                        completed_at = NULL, updated_at = CURRENT_TIMESTAMP
                    WHERE id = ?4
                    "#,
                )
                .bind(action)
                .bind(LedgerStatus::Pending)
                .bind(request_data)
                .bind(entry.id)
                .execute(&**db)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO mount_ledger (
                        job_id, backup_target_id, host, mounted,
                        action_last, status_last, request_data
                    )
                    VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6)
                    "#,
                )
                .bind(key.job_id)
                .bind(&key.backup_target_id)
                .bind(&key.host)
                .bind(action)
                .bind(LedgerStatus::Pending)
                .bind(request_data)
                .execute(&**db)
                .await?;
            }
        }

        Self::get_by_key(key, db)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    /// Record a successful outcome. `mounted` reflects the kernel state
    /// after the operation; `mount_path` is only overwritten when the
    /// caller supplies one.
    pub async fn mark_success(
        key: &LedgerKey,
        mount_path: Option<&str>,
        response_data: Option<&str>,
        mounted: bool,
        success_msg: Option<&str>,
        db: &Database,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE mount_ledger
            SET status_last = ?1, mounted = ?2,
                mount_path = COALESCE(?3, mount_path),
                response_data = ?4, success_msg = ?5,
                completed_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
            WHERE job_id = ?6 AND backup_target_id = ?7 AND host = ?8 AND deleted = 0
            "#,
        )
        .bind(LedgerStatus::Success)
        .bind(mounted)
        .bind(mount_path)
        .bind(response_data)
        .bind(success_msg)
        .bind(key.job_id)
        .bind(&key.backup_target_id)
        .bind(&key.host)
        .execute(&**db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a failed outcome. `mounted` is left untouched: an error
    /// tells us nothing new about the kernel state.
    pub async fn mark_error(
        key: &LedgerKey,
        error_msg: &str,
        response_data: Option<&str>,
        db: &Database,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE mount_ledger
            SET status_last = ?1, error_msg = ?2, response_data = ?3,
                completed_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
            WHERE job_id = ?4 AND backup_target_id = ?5 AND host = ?6 AND deleted = 0
            "#,
        )
        .bind(LedgerStatus::Error)
        .bind(error_msg)
        .bind(response_data)
        .bind(key.job_id)
        .bind(&key.backup_target_id)
        .bind(&key.host)
        .execute(&**db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Reference count: live rows holding the target mounted on the host.
    pub async fn count_active(
        backup_target_id: &str,
        host: &str,
        db: &Database,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM mount_ledger
            WHERE backup_target_id = ?1 AND host = ?2 AND mounted = 1 AND deleted = 0
            "#,
        )
        .bind(backup_target_id)
        .bind(host)
        .fetch_one(&**db)
        .await
    }

    /// Job ids of the live mounted rows for (target, host).
    pub async fn active_jobs(
        backup_target_id: &str,
        host: &str,
        db: &Database,
    ) -> Result<Vec<i64>, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            r#"
            SELECT job_id
            FROM mount_ledger
            WHERE backup_target_id = ?1 AND host = ?2 AND mounted = 1 AND deleted = 0
            ORDER BY job_id ASC
            "#,
        )
        .bind(backup_target_id)
        .bind(host)
        .fetch_all(&**db)
        .await
    }

    pub async fn get_by_key(
        key: &LedgerKey,
        db: &Database,
    ) -> Result<Option<LedgerEntry>, sqlx::Error> {
        sqlx::query_as::<_, LedgerEntry>(&format!(
            r#"
            SELECT {COLUMNS}
            FROM mount_ledger
            WHERE job_id = ?1 AND backup_target_id = ?2 AND host = ?3 AND deleted = 0
            "#
        ))
        .bind(key.job_id)
        .bind(&key.backup_target_id)
        .bind(&key.host)
        .fetch_optional(&**db)
        .await
    }

    /// Live mounted rows, optionally narrowed to a host and/or target.
    pub async fn list_active(
        host: Option<&str>,
        backup_target_id: Option<&str>,
        db: &Database,
    ) -> Result<Vec<LedgerEntry>, sqlx::Error> {
        sqlx::query_as::<_, LedgerEntry>(&format!(
            r#"
            SELECT {COLUMNS}
            FROM mount_ledger
            WHERE mounted = 1 AND deleted = 0
              AND (?1 IS NULL OR host = ?1)
              AND (?2 IS NULL OR backup_target_id = ?2)
            ORDER BY updated_at DESC, id DESC
            "#
        ))
        .bind(host)
        .bind(backup_target_id)
        .fetch_all(&**db)
        .await
    }

    /// Recent rows for a target, newest first. Soft-deleted rows are
    /// retained here for forensics.
    pub async fn history_by_target(
        backup_target_id: &str,
        limit: i64,
        db: &Database,
    ) -> Result<Vec<LedgerEntry>, sqlx::Error> {
        sqlx::query_as::<_, LedgerEntry>(&format!(
            r#"
            SELECT {COLUMNS}
            FROM mount_ledger
            WHERE backup_target_id = ?1
            ORDER BY updated_at DESC, id DESC
            LIMIT ?2
            "#
        ))
        .bind(backup_target_id)
        .bind(limit)
        .fetch_all(&**db)
        .await
    }

    /// Retire the live row for a key. Returns false when no live row
    /// exists.
    pub async fn soft_delete(key: &LedgerKey, db: &Database) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE mount_ledger
            SET deleted = 1, deleted_at = CURRENT_TIMESTAMP, updated_at = CURRENT_TIMESTAMP
            WHERE job_id = ?1 AND backup_target_id = ?2 AND host = ?3 AND deleted = 0
            "#,
        )
        .bind(key.job_id)
        .bind(&key.backup_target_id)
        .bind(&key.host)
        .execute(&**db)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
