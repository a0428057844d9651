//! Remote backup targets: persistence and the registry that keeps the
//! transfer configuration in step with them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::PgPool;
use sqlx::types::Json;
use std::sync::Arc;
use tracing::{error, info};

use crate::errors::{AppError, Result};
use crate::transfer::{ProviderConfig, TargetKind, TargetSpec, TransferTool, section_name};

const SCHEMA: [&str; 3] = [
    r#"CREATE TABLE IF NOT EXISTS backup_targets (
        id SERIAL PRIMARY KEY,
        name TEXT UNIQUE NOT NULL,
        kind TEXT NOT NULL,
        remote_path TEXT,
        config JSONB NOT NULL DEFAULT '{}',
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ DEFAULT NOW(),
        updated_at TIMESTAMPTZ DEFAULT NOW()
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_backup_targets_name ON backup_targets (name)",
    "CREATE INDEX IF NOT EXISTS idx_backup_targets_kind ON backup_targets (kind)",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupTarget {
    pub id: i32,
    pub name: String,
    pub kind: String,
    pub remote_path: Option<String>,
    pub config: Map<String, Value>,
    pub enabled: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl BackupTarget {
    pub fn to_spec(&self) -> Result<TargetSpec> {
        let kind = TargetKind::parse(&self.kind)
            .ok_or_else(|| AppError::Validation(format!("target '{}' has no kind", self.name)))?;
        Ok(TargetSpec {
            name: self.name.clone(),
            kind,
            remote_path: self.remote_path.clone(),
            config: self.config.clone(),
            enabled: self.enabled,
        })
    }
}

/// Create-or-update request. Absent fields keep the stored value on update.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetPayload {
    pub id: Option<i32>,
    pub name: Option<String>,
    pub kind: Option<String>,
    pub remote_path: Option<String>,
    pub enabled: Option<bool>,
    pub config: Option<Value>,
}

/// Normalized target ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRecord {
    pub name: String,
    pub kind: String,
    pub remote_path: Option<String>,
    pub config: Map<String, Value>,
    pub enabled: bool,
}

#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn list(&self) -> Result<Vec<BackupTarget>>;
    async fn get(&self, id: i32) -> Result<Option<BackupTarget>>;
    async fn name_taken(&self, name: &str, exclude_id: Option<i32>) -> Result<bool>;
    async fn insert(&self, record: &TargetRecord) -> Result<BackupTarget>;
    async fn update(&self, id: i32, record: &TargetRecord) -> Result<Option<BackupTarget>>;
    async fn delete(&self, id: i32) -> Result<bool>;
}

#[derive(sqlx::FromRow)]
struct TargetRow {
    id: i32,
    name: String,
    kind: String,
    remote_path: Option<String>,
    config: Json<Value>,
    enabled: bool,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<TargetRow> for BackupTarget {
    fn from(row: TargetRow) -> Self {
        let config = match row.config.0 {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        BackupTarget {
            id: row.id,
            name: row.name,
            kind: row.kind,
            remote_path: row.remote_path,
            config,
            enabled: row.enabled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const COLUMNS: &str = "id, name, kind, remote_path, config, enabled, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgTargetStore {
    pool: PgPool,
}

impl PgTargetStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the `backup_targets` table and its indexes if missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn map_unique_violation(e: sqlx::Error, name: &str) -> AppError {
    match &e {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            AppError::Validation(format!("a target named '{name}' already exists"))
        }
        _ => AppError::Database(e),
    }
}

#[async_trait]
impl TargetStore for PgTargetStore {
    async fn list(&self) -> Result<Vec<BackupTarget>> {
        let rows: Vec<TargetRow> = sqlx::query_as(&format!("SELECT {COLUMNS} FROM backup_targets ORDER BY id ASC"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(BackupTarget::from).collect())
    }

    async fn get(&self, id: i32) -> Result<Option<BackupTarget>> {
        let row: Option<TargetRow> = sqlx::query_as(&format!("SELECT {COLUMNS} FROM backup_targets WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(BackupTarget::from))
    }

    async fn name_taken(&self, name: &str, exclude_id: Option<i32>) -> Result<bool> {
        let taken: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM backup_targets WHERE name = $1 AND ($2::INT IS NULL OR id <> $2))",
        )
        .bind(name)
        .bind(exclude_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(taken)
    }

    async fn insert(&self, record: &TargetRecord) -> Result<BackupTarget> {
        let row: TargetRow = sqlx::query_as(&format!(
            "INSERT INTO backup_targets (name, kind, remote_path, config, enabled) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {COLUMNS}"
        ))
        .bind(&record.name)
        .bind(&record.kind)
        .bind(&record.remote_path)
        .bind(Json(Value::Object(record.config.clone())))
        .bind(record.enabled)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &record.name))?;
        Ok(row.into())
    }

    async fn update(&self, id: i32, record: &TargetRecord) -> Result<Option<BackupTarget>> {
        let row: Option<TargetRow> = sqlx::query_as(&format!(
            "UPDATE backup_targets SET name = $2, kind = $3, remote_path = $4, config = $5, enabled = $6, \
             updated_at = NOW() WHERE id = $1 RETURNING {COLUMNS}"
        ))
        .bind(id)
        .bind(&record.name)
        .bind(&record.kind)
        .bind(&record.remote_path)
        .bind(Json(Value::Object(record.config.clone())))
        .bind(record.enabled)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_unique_violation(e, &record.name))?;
        Ok(row.map(BackupTarget::from))
    }

    async fn delete(&self, id: i32) -> Result<bool> {
        let done = sqlx::query("DELETE FROM backup_targets WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }
}

/// Drops an rclone-style `remote:` prefix and the slashes right after it;
/// blank becomes `None`.
pub fn normalize_remote_path(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let path = match trimmed.split_once(':') {
        Some((_, rest)) => rest.trim_start_matches('/'),
        None => trimmed,
    };
    let path = path.trim();
    (!path.is_empty()).then(|| path.to_string())
}

#[derive(Clone)]
pub struct TargetRegistry {
    store: Arc<dyn TargetStore>,
    transfer: Arc<dyn TransferTool>,
}

impl TargetRegistry {
    pub fn new(store: Arc<dyn TargetStore>, transfer: Arc<dyn TransferTool>) -> Self {
        Self { store, transfer }
    }

    pub async fn list(&self) -> Result<Vec<BackupTarget>> {
        self.store.list().await
    }

    pub async fn get(&self, id: i32) -> Result<Option<BackupTarget>> {
        self.store.get(id).await
    }

    /// Targets for `ids`, in the order the store lists them. Unknown ids are skipped.
    pub async fn find_by_ids(&self, ids: &[i32]) -> Result<Vec<BackupTarget>> {
        let all = self.store.list().await?;
        Ok(all.into_iter().filter(|t| ids.contains(&t.id)).collect())
    }

    /// Existing, enabled target or an error naming why it cannot be used.
    pub async fn require_enabled(&self, id: i32) -> Result<BackupTarget> {
        let target = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("target {id}")))?;
        if !target.enabled {
            return Err(AppError::Validation(format!("target '{}' is disabled", target.name)));
        }
        Ok(target)
    }

    pub async fn upsert(&self, payload: TargetPayload) -> Result<BackupTarget> {
        let existing = match payload.id {
            Some(id) => Some(
                self.store
                    .get(id)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("target {id}")))?,
            ),
            None => None,
        };
        let record = merge_payload(existing.as_ref(), &payload)?;

        if self.store.name_taken(&record.name, payload.id).await? {
            return Err(AppError::Validation(format!(
                "a target named '{}' already exists",
                record.name
            )));
        }
        let section = section_name(&record.name);
        let clash = self
            .store
            .list()
            .await?
            .into_iter()
            .find(|t| Some(t.id) != payload.id && section_name(&t.name) == section);
        if let Some(other) = clash {
            return Err(AppError::Validation(format!(
                "'{}' and '{}' would share the configuration section [{}]",
                record.name, other.name, section
            )));
        }

        let saved = match payload.id {
            Some(id) => self
                .store
                .update(id, &record)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("target {id}")))?,
            None => self.store.insert(&record).await?,
        };
        info!("Saved backup target {} ({})", saved.name, saved.kind);

        self.regenerate().await;
        Ok(saved)
    }

    /// `false` when no target has this id.
    pub async fn delete(&self, id: i32) -> Result<bool> {
        let deleted = self.store.delete(id).await?;
        if deleted {
            info!("Deleted backup target {}", id);
            self.regenerate().await;
        }
        Ok(deleted)
    }

    /// Rewrites the transfer configuration for every enabled target. Failures
    /// are logged; the stored targets stay as they are.
    pub async fn regenerate(&self) {
        if let Err(e) = self.try_regenerate().await {
            error!("Could not regenerate the transfer configuration: {}", e);
        }
    }

    async fn try_regenerate(&self) -> Result<()> {
        let specs = self
            .store
            .list()
            .await?
            .iter()
            .filter(|t| t.enabled)
            .map(BackupTarget::to_spec)
            .collect::<Result<Vec<_>>>()?;
        self.transfer.build_config(&specs).await
    }
}

fn merge_payload(existing: Option<&BackupTarget>, payload: &TargetPayload) -> Result<TargetRecord> {
    let name = payload
        .name
        .as_deref()
        .map(str::trim)
        .map(str::to_string)
        .or_else(|| existing.map(|t| t.name.clone()))
        .unwrap_or_default();

    let kind = match payload.kind.as_deref() {
        Some(raw) => TargetKind::parse(raw),
        None => existing.and_then(|t| TargetKind::parse(&t.kind)),
    };

    let (name, kind) = match (name.is_empty(), kind) {
        (false, Some(kind)) => (name, kind),
        _ => return Err(AppError::Validation("name and kind are required".to_string())),
    };

    let remote_path = match &payload.remote_path {
        Some(raw) => normalize_remote_path(raw),
        None => existing.and_then(|t| t.remote_path.clone()),
    };

    let config = match &payload.config {
        Some(Value::Object(map)) => map.clone(),
        Some(Value::Null) => Map::new(),
        Some(_) => return Err(AppError::Validation("config must be a JSON object".to_string())),
        None => existing.map(|t| t.config.clone()).unwrap_or_default(),
    };

    let enabled = payload
        .enabled
        .or_else(|| existing.map(|t| t.enabled))
        .unwrap_or(true);

    ProviderConfig::from_target(&name, &kind, &config)?;

    Ok(TargetRecord {
        name,
        kind: kind.as_str().to_string(),
        remote_path,
        config,
        enabled,
    })
}
