//! Database side of backup and restore.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use crate::backup::db_dump;
use crate::errors::{AppError, Result};
use crate::restore::db_restore;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").unwrap());

#[async_trait]
pub trait DatabaseOps: Send + Sync {
    /// Writes a custom-format dump of the whole database to `dest`.
    async fn dump(&self, dest: &Path) -> Result<()>;
    /// Current settings row as a JSON object.
    async fn settings_snapshot(&self) -> Result<Map<String, Value>>;
    async fn terminate_other_sessions(&self) -> Result<u64>;
    async fn restore_dump(&self, dump: &Path) -> Result<()>;
    async fn restore_settings(&self, settings: &Map<String, Value>) -> Result<()>;
}

/// PostgreSQL through the client tools plus a lazily connected pool.
#[derive(Debug, Clone)]
pub struct PgTools {
    database_url: String,
    pg_dump: PathBuf,
    pg_restore: PathBuf,
    timeout: Duration,
    settings_table: String,
    pool: PgPool,
}

impl PgTools {
    pub fn new(
        database_url: &str,
        pg_dump: PathBuf,
        pg_restore: PathBuf,
        timeout: Duration,
        settings_table: &str,
    ) -> Result<Self> {
        if !IDENTIFIER.is_match(settings_table) {
            return Err(AppError::Config(format!(
                "invalid settings table name: {settings_table}"
            )));
        }
        let pool = PgPoolOptions::new().max_connections(4).connect_lazy(database_url)?;
        Ok(Self {
            database_url: database_url.to_string(),
            pg_dump,
            pg_restore,
            timeout,
            settings_table: settings_table.to_string(),
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DatabaseOps for PgTools {
    async fn dump(&self, dest: &Path) -> Result<()> {
        db_dump::dump_database(&self.pg_dump, &self.database_url, dest, self.timeout).await
    }

    async fn settings_snapshot(&self) -> Result<Map<String, Value>> {
        db_dump::snapshot_settings(&self.pool, &self.settings_table).await
    }

    async fn terminate_other_sessions(&self) -> Result<u64> {
        db_restore::terminate_other_sessions(&self.pool).await
    }

    async fn restore_dump(&self, dump: &Path) -> Result<()> {
        db_restore::restore_dump(&self.pg_restore, &self.database_url, dump, self.timeout).await
    }

    async fn restore_settings(&self, settings: &Map<String, Value>) -> Result<()> {
        db_restore::restore_settings_row(&self.pool, &self.settings_table, settings).await
    }
}
