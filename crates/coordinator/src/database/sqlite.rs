use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use super::DatabaseSetupError;

/// Schema and indexes, applied idempotently at connect time. The four
/// indexes back the queries executed while the host lock is held.
const MIGRATION: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS mount_ledger (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL,
        backup_target_id VARCHAR(255) NOT NULL,
        host VARCHAR(255) NOT NULL,
        mounted INTEGER NOT NULL DEFAULT 0,
        mount_path VARCHAR(512),
        action_last VARCHAR(20) NOT NULL,
        status_last VARCHAR(20) NOT NULL,
        request_data TEXT,
        response_data TEXT,
        error_msg TEXT,
        success_msg TEXT,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        completed_at TIMESTAMP,
        deleted INTEGER NOT NULL DEFAULT 0,
        deleted_at TIMESTAMP
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_mount_ledger_target_host_mounted
        ON mount_ledger (backup_target_id, host, mounted)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_mount_ledger_job
        ON mount_ledger (job_id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_mount_ledger_host_mounted
        ON mount_ledger (host, mounted)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_mount_ledger_deleted
        ON mount_ledger (deleted)
    "#,
];

pub(crate) async fn connect_sqlite(url: &url::Url) -> Result<SqlitePool, DatabaseSetupError> {
    let options = SqliteConnectOptions::from_str(url.as_str())
        .map_err(DatabaseSetupError::Unavailable)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));

    let mut pool_options = SqlitePoolOptions::new();
    if url.path() == ":memory:" {
        // Every pooled connection would otherwise get its own empty
        // in-memory database.
        pool_options = pool_options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }

    pool_options
        .connect_with(options)
        .await
        .map_err(DatabaseSetupError::Unavailable)
}

pub(crate) async fn migrate_sqlite(pool: &SqlitePool) -> Result<(), DatabaseSetupError> {
    for statement in MIGRATION {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(DatabaseSetupError::MigrationFailed)?;
    }
    Ok(())
}
