use serde_json::{Map, Value};
use sqlx::PgPool;
use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::errors::Result;
use crate::utils::command::run_tool;
use crate::utils::redact_url;

/// Dumps the database in pg_dump's custom format (`-Fc`) to `dest`.
pub async fn dump_database(pg_dump: &Path, database_url: &str, dest: &Path, timeout: Duration) -> Result<()> {
    info!("Dumping database {} to {}", redact_url(database_url), dest.display());
    let label = format!("pg_dump -Fc -f {} {}", dest.display(), redact_url(database_url));
    let args = [
        OsStr::new("-Fc"),
        OsStr::new("-f"),
        dest.as_os_str(),
        OsStr::new(database_url),
    ];
    run_tool(pg_dump, args, &label, timeout).await?;
    info!("✓ Database dumped");
    Ok(())
}

/// First row of the settings table as a JSON object, or an empty object when
/// the table has no rows.
pub async fn snapshot_settings(pool: &PgPool, table: &str) -> Result<Map<String, Value>> {
    let sql = format!("SELECT row_to_json(t) FROM (SELECT * FROM {table} ORDER BY id ASC LIMIT 1) t");
    let row: Option<Value> = sqlx::query_scalar(&sql).fetch_optional(pool).await?;
    match row {
        Some(Value::Object(map)) => Ok(map),
        Some(other) => {
            warn!("Unexpected settings snapshot shape: {}", other);
            Ok(Map::new())
        }
        None => {
            warn!("Settings table {} is empty, snapshot will be empty", table);
            Ok(Map::new())
        }
    }
}
