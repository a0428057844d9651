use chrono::{Local, Utc};
use serde_json::{Map, Value, json};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{error, info, warn};

use super::archive::{ArchiveMember, create_archive};
use super::naming::backup_file_name;
use super::{ARCHIVE_MEMBERS, DB_DUMP, MANIFEST_FILE, SETTINGS_FILE, UPLOADS_ARCHIVE, UPLOADS_ROOT};
use crate::errors::Result;
use crate::notify::{BackupReport, DestinationResult, LOCAL_DESTINATION, summarize_error};
use crate::service::ServiceContext;
use crate::status::{JobState, RunReporter};
use crate::targets::BackupTarget;
use crate::transfer::TargetSpec;
use crate::utils::retry::retry_async;
use crate::utils::size_in_mb;

#[derive(Debug, Clone, PartialEq)]
pub struct BackupOutcome {
    pub backup_name: String,
    pub path: PathBuf,
    pub file_size_mb: f64,
    /// Local save first, then one entry per attempted target.
    pub destinations: Vec<DestinationResult>,
}

impl BackupOutcome {
    /// Remote targets that received the archive.
    pub fn uploaded_to(&self) -> Vec<String> {
        self.destinations
            .iter()
            .skip(1)
            .filter(|d| d.success)
            .map(|d| d.name.clone())
            .collect()
    }
}

/// Creates a complete backup and, when `target_ids` is not empty, uploads it
/// to those targets.
///
/// Failed uploads are reported per target and do not fail the backup. Any
/// other failure leaves the status at `error`, sends a failure report and is
/// returned.
pub async fn perform_backup_orchestration(ctx: &ServiceContext, target_ids: &[i32]) -> Result<BackupOutcome> {
    let backup_name = backup_file_name(&ctx.backup_prefix, Local::now());
    let mut reporter = RunReporter::new(ctx.status.clone(), as_map(json!({ "backup_id": backup_name })));
    info!("🚀 Starting backup {}", backup_name);
    reporter.running(0, "Starting backup...");

    match run_backup(ctx, &backup_name, target_ids, &mut reporter).await {
        Ok(outcome) => {
            reporter.finish(
                JobState::Completed,
                100,
                "Backup completed",
                as_map(json!({
                    "uploaded_to": outcome.uploaded_to(),
                    "file_size_mb": outcome.file_size_mb,
                })),
            );
            info!("✅ Backup {} completed ({} MB)", outcome.backup_name, outcome.file_size_mb);
            ctx.notify(&BackupReport::Completed {
                backup_name: outcome.backup_name.clone(),
                file_size_mb: outcome.file_size_mb,
                destinations: outcome.destinations.clone(),
            })
            .await;
            Ok(outcome)
        }
        Err(e) => {
            let message = e.to_string();
            error!("❌ Backup {} failed: {}", backup_name, message);
            reporter.finish(
                JobState::Error,
                0,
                &format!("Backup failed: {message}"),
                as_map(json!({ "error": message })),
            );
            ctx.notify(&BackupReport::Failed { error: message }).await;
            Err(e)
        }
    }
}

async fn run_backup(
    ctx: &ServiceContext,
    backup_name: &str,
    target_ids: &[i32],
    reporter: &mut RunReporter,
) -> Result<BackupOutcome> {
    fs::create_dir_all(&ctx.backups_dir)?;
    let workspace = tempfile::Builder::new()
        .prefix(".backup-")
        .tempdir_in(&ctx.backups_dir)?;

    reporter.running(10, "Dumping database...");
    let dump_path = workspace.path().join(DB_DUMP);
    ctx.database.dump(&dump_path).await?;

    reporter.running(40, "Compressing uploads...");
    let uploads_archive = workspace.path().join(UPLOADS_ARCHIVE);
    archive_uploads(&ctx.uploads_dir, &uploads_archive).await?;

    reporter.running(60, "Exporting settings...");
    let settings = match ctx.database.settings_snapshot().await {
        Ok(settings) => settings,
        Err(e) => {
            warn!("Settings snapshot failed, storing an empty object: {}", e);
            Map::new()
        }
    };
    let settings_path = workspace.path().join(SETTINGS_FILE);
    fs::write(&settings_path, serde_json::to_vec_pretty(&settings)?)?;

    let manifest = json!({
        "created_at": Utc::now().to_rfc3339(),
        "kind": "full",
        "files": ARCHIVE_MEMBERS,
    });
    let manifest_path = workspace.path().join(MANIFEST_FILE);
    fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)?;

    reporter.running(80, "Creating final archive...");
    let output = ctx.backups_dir.join(backup_name);
    let members = vec![
        ArchiveMember::path(dump_path, DB_DUMP),
        ArchiveMember::path(uploads_archive, UPLOADS_ARCHIVE),
        ArchiveMember::path(settings_path, SETTINGS_FILE),
        ArchiveMember::path(manifest_path, MANIFEST_FILE),
    ];
    let archive_out = output.clone();
    tokio::task::spawn_blocking(move || create_archive(&archive_out, &members)).await??;

    reporter.running(90, "Finalizing...");
    let file_size_mb = size_in_mb(fs::metadata(&output)?.len());
    drop(workspace);

    let mut destinations = vec![DestinationResult::ok(LOCAL_DESTINATION)];
    if !target_ids.is_empty() {
        destinations.extend(upload_to_targets(ctx, &output, target_ids, reporter).await?);
    }

    Ok(BackupOutcome {
        backup_name: backup_name.to_string(),
        path: output,
        file_size_mb,
        destinations,
    })
}

async fn archive_uploads(uploads_dir: &Path, output: &Path) -> Result<()> {
    let member = if uploads_dir.is_dir() {
        ArchiveMember::path(uploads_dir, UPLOADS_ROOT)
    } else {
        info!("Uploads directory {} not found, archiving an empty folder", uploads_dir.display());
        ArchiveMember::empty_dir(UPLOADS_ROOT)
    };
    let output = output.to_path_buf();
    tokio::task::spawn_blocking(move || create_archive(&output, &[member])).await??;
    Ok(())
}

/// Uploads `archive` to every enabled target in `target_ids`. Only a failure to
/// look the targets up is returned; everything else becomes a failed entry.
async fn upload_to_targets(
    ctx: &ServiceContext,
    archive: &Path,
    target_ids: &[i32],
    reporter: &mut RunReporter,
) -> Result<Vec<DestinationResult>> {
    let targets = ctx.registry.find_by_ids(target_ids).await?;
    if targets.len() < target_ids.len() {
        warn!("{} requested target(s) do not exist", target_ids.len() - targets.len());
    }

    let mut chosen: Vec<(BackupTarget, TargetSpec)> = Vec::new();
    let mut results = Vec::new();
    for target in targets {
        if !target.enabled {
            info!("Skipping disabled target {}", target.name);
            continue;
        }
        match target.to_spec() {
            Ok(spec) => chosen.push((target, spec)),
            Err(e) => results.push(DestinationResult::failed(target.name.clone(), e.to_string())),
        }
    }
    if chosen.is_empty() {
        return Ok(results);
    }

    let specs: Vec<TargetSpec> = chosen.iter().map(|(_, spec)| spec.clone()).collect();
    if let Err(e) = ctx.transfer.build_config(&specs).await {
        error!("Could not build the transfer configuration: {}", e);
        let reason = format!("Transfer configuration failed: {}", summarize_error(&e.to_string()));
        results.extend(chosen.iter().map(|(t, _)| DestinationResult::failed(t.name.clone(), reason.clone())));
        return Ok(results);
    }

    let max_attempts = ctx.retry.max_attempts.max(1);
    let transfer = ctx.transfer.as_ref();
    for (target, spec) in &chosen {
        reporter.running(92, &format!("Uploading to {}...", target.name));
        let made = AtomicU32::new(0);
        let attempts = &made;
        let uploaded = retry_async(
            &ctx.retry,
            move |attempt| {
                attempts.store(attempt, Ordering::Relaxed);
                if attempt > 1 {
                    info!("Attempt {}/{} for upload to {}", attempt, max_attempts, spec.name);
                }
                transfer.copy_to(archive, spec)
            },
            |e| e.is_transient(),
        )
        .await;

        match uploaded {
            Ok(()) => results.push(DestinationResult::ok(target.name.clone())),
            Err(e) => {
                error!("Upload to {} failed: {}", target.name, e);
                results.push(DestinationResult::failed(
                    target.name.clone(),
                    format!("Failed after {}: {}", attempt_count(made.into_inner()), summarize_error(&e.to_string())),
                ));
            }
        }
    }
    Ok(results)
}

fn attempt_count(n: u32) -> String {
    if n == 1 { "1 attempt".to_string() } else { format!("{} attempts", n) }
}

fn as_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
