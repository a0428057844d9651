use serde_json::{Map, Value};
use sqlx::PgPool;
use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::errors::{AppError, Result};
use crate::utils::command::run_tool;
use crate::utils::redact_url;

/// Terminates every other session connected to the current database.
/// Returns the number of sessions signalled.
pub async fn terminate_other_sessions(pool: &PgPool) -> Result<u64> {
    let done = sqlx::query(
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
         WHERE datname = current_database() AND pid <> pg_backend_pid()",
    )
    .execute(pool)
    .await?;
    Ok(done.rows_affected())
}

/// Restores a custom-format dump over the existing database objects.
pub async fn restore_dump(pg_restore: &Path, database_url: &str, dump: &Path, timeout: Duration) -> Result<()> {
    if !dump.is_file() {
        return Err(AppError::InvalidArchive(format!(
            "database dump not found: {}",
            dump.display()
        )));
    }
    info!("Restoring {} into {}", dump.display(), redact_url(database_url));
    let label = format!(
        "pg_restore --clean --if-exists --no-owner --dbname {} {}",
        redact_url(database_url),
        dump.display()
    );
    let args = [
        OsStr::new("--clean"),
        OsStr::new("--if-exists"),
        OsStr::new("--no-owner"),
        OsStr::new("--dbname"),
        OsStr::new(database_url),
        dump.as_os_str(),
    ];
    run_tool(pg_restore, args, &label, timeout).await?;
    info!("✓ Database restored");
    Ok(())
}

/// Replaces the contents of the settings table with `settings`, in one
/// transaction.
pub async fn restore_settings_row(pool: &PgPool, table: &str, settings: &Map<String, Value>) -> Result<()> {
    if settings.is_empty() {
        return Err(AppError::InvalidArchive("settings.json is empty".to_string()));
    }
    let mut tx = pool.begin().await?;
    sqlx::query(&format!("DELETE FROM {table}")).execute(&mut *tx).await?;
    sqlx::query(&format!(
        "INSERT INTO {table} SELECT * FROM jsonb_populate_record(NULL::{table}, $1)"
    ))
    .bind(Value::Object(settings.clone()))
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    info!("✓ Settings row restored into {}", table);
    Ok(())
}
