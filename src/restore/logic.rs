use serde_json::{Map, Value, json};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::{error, info, warn};

use super::uploads::{replace_directory_contents, uploads_source};
use crate::backup::archive::safe_extract;
use crate::backup::{ARCHIVE_MEMBERS, DB_DUMP, SETTINGS_FILE, UPLOADS_ARCHIVE, validate_backup_name};
use crate::errors::{AppError, Result};
use crate::notify::BackupReport;
use crate::service::ServiceContext;
use crate::status::{JobState, RunReporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreType {
    /// Database and uploads.
    Full,
    Database,
    Uploads,
    /// Only the settings row, from `settings.json`.
    Config,
}

impl RestoreType {
    fn restores_database(self) -> bool {
        matches!(self, RestoreType::Full | RestoreType::Database)
    }

    fn restores_uploads(self) -> bool {
        matches!(self, RestoreType::Full | RestoreType::Uploads)
    }

    fn restores_settings(self) -> bool {
        self == RestoreType::Config
    }

    /// Archive members this restore cannot do without.
    fn required_members(self) -> &'static [&'static str] {
        match self {
            RestoreType::Full => &ARCHIVE_MEMBERS,
            RestoreType::Database => &[DB_DUMP],
            RestoreType::Uploads => &[UPLOADS_ARCHIVE],
            RestoreType::Config => &[SETTINGS_FILE],
        }
    }
}

impl FromStr for RestoreType {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "" | "full" => Ok(RestoreType::Full),
            "database" | "db" => Ok(RestoreType::Database),
            "volumes" | "uploads" => Ok(RestoreType::Uploads),
            "config" => Ok(RestoreType::Config),
            other => Err(AppError::Validation(format!("unknown restore type: {other}"))),
        }
    }
}

impl fmt::Display for RestoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestoreType::Full => "full",
            RestoreType::Database => "database",
            RestoreType::Uploads => "uploads",
            RestoreType::Config => "config",
        })
    }
}

/// Restores the local archive `backup_name`.
///
/// Every failure, including an invalid name or a missing archive, leaves the
/// status at `error` and sends a failure report before it is returned. Steps
/// already applied are not rolled back.
pub async fn perform_restore_orchestration(ctx: &ServiceContext, backup_name: &str, restore_type: &str) -> Result<()> {
    let mut reporter = RunReporter::new(
        ctx.status.clone(),
        as_map(json!({ "backup_id": backup_name, "restore_type": restore_type })),
    );
    info!("🔄 Starting {} restore of {}", restore_type, backup_name);
    reporter.running(0, "Starting restore...");

    match run_restore(ctx, backup_name, restore_type, &mut reporter).await {
        Ok(()) => {
            reporter.finish(JobState::Success, 100, "Restore completed", Map::new());
            info!("✅ Restore of {} completed", backup_name);
            Ok(())
        }
        Err(e) => {
            let message = e.to_string();
            error!("❌ Restore of {} failed: {}", backup_name, message);
            reporter.finish(
                JobState::Error,
                0,
                &format!("Restore failed: {message}"),
                as_map(json!({ "error": message })),
            );
            ctx.notify(&BackupReport::RestoreFailed {
                backup_name: backup_name.to_string(),
                restore_type: restore_type.to_string(),
                error: message,
            })
            .await;
            Err(e)
        }
    }
}

async fn run_restore(
    ctx: &ServiceContext,
    backup_name: &str,
    restore_type: &str,
    reporter: &mut RunReporter,
) -> Result<()> {
    let name = validate_backup_name(backup_name)?;
    let restore_type: RestoreType = restore_type.parse()?;
    let archive = ctx.backups_dir.join(name);
    if !archive.is_file() {
        return Err(AppError::NotFound(format!("backup {name}")));
    }

    let workspace = tempfile::Builder::new()
        .prefix(".restore-")
        .tempdir_in(&ctx.backups_dir)?;
    let extracted = workspace.path().join("archive");

    reporter.running(10, "Extracting archive...");
    {
        let archive = archive.clone();
        let extracted = extracted.clone();
        tokio::task::spawn_blocking(move || safe_extract(&archive, &extracted)).await??;
    }
    check_members(&extracted, restore_type)?;

    if restore_type.restores_database() {
        reporter.running(40, "Restoring database...");
        match ctx.database.terminate_other_sessions().await {
            Ok(n) => info!("Terminated {} other database session(s)", n),
            Err(e) => warn!("Could not terminate other database sessions: {}", e),
        }
        ctx.database.restore_dump(&extracted.join(DB_DUMP)).await?;
    }

    if restore_type.restores_settings() {
        reporter.running(55, "Restoring settings...");
        let raw = fs::read(extracted.join(SETTINGS_FILE))?;
        let settings = match serde_json::from_slice::<Value>(&raw)? {
            Value::Object(map) => map,
            _ => return Err(AppError::InvalidArchive("settings.json is not a JSON object".to_string())),
        };
        ctx.database.restore_settings(&settings).await?;
    }

    if restore_type.restores_uploads() {
        reporter.running(70, "Restoring uploads...");
        let nested = extracted.join(UPLOADS_ARCHIVE);
        let unpacked = workspace.path().join("uploads_extracted");
        let live = ctx.uploads_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<u64> {
            safe_extract(&nested, &unpacked)?;
            replace_directory_contents(&uploads_source(&unpacked), &live)
        })
        .await??;
    }

    Ok(())
}

fn check_members(extracted: &Path, restore_type: RestoreType) -> Result<()> {
    let missing: Vec<&str> = restore_type
        .required_members()
        .iter()
        .copied()
        .filter(|m| !extracted.join(m).is_file())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(AppError::InvalidArchive(format!(
            "missing {} for a {} restore",
            missing.join(", "),
            restore_type
        )))
    }
}

fn as_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
