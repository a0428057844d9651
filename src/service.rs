//! Entry points the host application calls.

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::backup::{BackupOutcome, perform_backup_orchestration, validate_backup_name};
use crate::config::AppConfig;
use crate::database::{DatabaseOps, PgTools};
use crate::errors::{AppError, Result};
use crate::notify::{BackupReport, LogMailer, MailNotifier, Notifier};
use crate::restore::perform_restore_orchestration;
use crate::status::{BackupStatus, FileStatusStore, StatusStore};
use crate::targets::{PgTargetStore, TargetRegistry};
use crate::transfer::{RcloneObscurer, RcloneTransfer, TransferTool};
use crate::utils::retry::{RetryPolicy, retry_async};
use crate::utils::{find_executable, size_in_mb};

const ARCHIVE_EXTENSIONS: [&str; 3] = [".tar.gz", ".tgz", ".zip"];

/// Everything an orchestration run needs.
#[derive(Clone)]
pub struct ServiceContext {
    pub backups_dir: PathBuf,
    pub uploads_dir: PathBuf,
    pub backup_prefix: String,
    pub retry: RetryPolicy,
    pub database: Arc<dyn DatabaseOps>,
    pub transfer: Arc<dyn TransferTool>,
    pub status: Arc<dyn StatusStore>,
    pub notifier: Arc<dyn Notifier>,
    pub registry: TargetRegistry,
}

impl ServiceContext {
    /// Sends `report`; a delivery failure is only logged.
    pub async fn notify(&self, report: &BackupReport) {
        if let Err(e) = self.notifier.notify(report).await {
            warn!("Could not send the notification: {}", e);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupInfo {
    pub id: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub size_mb: f64,
    pub created_at: DateTime<Utc>,
    pub created_at_readable: String,
}

impl BackupInfo {
    fn from_path(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path)?;
        let created_at: DateTime<Utc> = meta.modified()?.into();
        Ok(Self {
            id: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: path.to_path_buf(),
            size_bytes: meta.len(),
            size_mb: size_in_mb(meta.len()),
            created_at,
            created_at_readable: created_at.with_timezone(&Local).format("%d/%m/%Y %H:%M").to_string(),
        })
    }
}

/// Backup/restore facade. Every operation that writes to the backups
/// directory or the database shares one in-process job slot; a second
/// concurrent call fails with [`AppError::Busy`].
pub struct BackupService {
    ctx: ServiceContext,
    job: Mutex<()>,
}

impl BackupService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            ctx,
            job: Mutex::new(()),
        }
    }

    /// Wires the PostgreSQL, rclone and file-backed implementations from `config`.
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        let tools = &config.tools;
        let pg_dump = find_executable("pg_dump", tools.pg_dump.as_deref())?;
        let pg_restore = find_executable("pg_restore", tools.pg_restore.as_deref())?;
        let rclone = find_executable("rclone", tools.rclone.as_deref()).unwrap_or_else(|e| {
            warn!("{} Remote targets will not work.", e);
            PathBuf::from("rclone")
        });

        let database = PgTools::new(
            &config.database_url,
            pg_dump,
            pg_restore,
            tools.command_timeout,
            &config.settings_table,
        )?;
        let store = PgTargetStore::new(database.pool().clone());
        store.ensure_schema().await?;

        let obscurer = Arc::new(RcloneObscurer::new(rclone.clone(), tools.obscure_timeout));
        let transfer: Arc<dyn TransferTool> = Arc::new(RcloneTransfer::new(
            rclone,
            &config.rclone_dir,
            obscurer,
            tools.command_timeout,
            tools.transfers,
            config.allow_plaintext_secret_fallback,
        ));
        for dir in [&config.backups_dir, &config.uploads_dir, &config.rclone_dir] {
            fs::create_dir_all(dir)?;
        }

        let notifier = MailNotifier::new(
            LogMailer,
            config.notifications.recipient.clone(),
            config.notifications.company_name.clone(),
        );
        let ctx = ServiceContext {
            backups_dir: config.backups_dir.clone(),
            uploads_dir: config.uploads_dir.clone(),
            backup_prefix: config.backup_prefix.clone(),
            retry: config.upload_retry,
            database: Arc::new(database),
            transfer: transfer.clone(),
            status: Arc::new(FileStatusStore::in_dir(&config.backups_dir)),
            notifier: Arc::new(notifier),
            registry: TargetRegistry::new(Arc::new(store), transfer),
        };
        Ok(Self::new(ctx))
    }

    pub fn context(&self) -> &ServiceContext {
        &self.ctx
    }

    pub fn targets(&self) -> &TargetRegistry {
        &self.ctx.registry
    }

    pub fn status(&self) -> BackupStatus {
        self.ctx.status.read()
    }

    pub async fn create_backup(&self, target_ids: &[i32]) -> Result<BackupOutcome> {
        let _job = self.job.try_lock().map_err(|_| AppError::Busy)?;
        perform_backup_orchestration(&self.ctx, target_ids).await
    }

    pub async fn restore_backup(&self, name: &str, restore_type: &str) -> Result<()> {
        let _job = self.job.try_lock().map_err(|_| AppError::Busy)?;
        perform_restore_orchestration(&self.ctx, name, restore_type).await
    }

    /// Imports an externally provided archive and restores it under the same job slot.
    pub async fn import_and_restore(&self, source: &Path, name: Option<&str>, restore_type: &str) -> Result<BackupInfo> {
        let _job = self.job.try_lock().map_err(|_| AppError::Busy)?;
        let info = self.import_file(source, name)?;
        perform_restore_orchestration(&self.ctx, &info.id, restore_type).await?;
        Ok(info)
    }

    /// Archives in the backups directory, newest first.
    pub fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        if !self.ctx.backups_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut backups = Vec::new();
        for entry in fs::read_dir(&self.ctx.backups_dir)? {
            let path = entry?.path();
            let is_archive = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| ARCHIVE_EXTENSIONS.iter().any(|ext| n.ends_with(ext)));
            if !is_archive || !path.is_file() {
                continue;
            }
            match BackupInfo::from_path(&path) {
                Ok(info) => backups.push(info),
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(backups)
    }

    pub fn backup_info(&self, name: &str) -> Result<BackupInfo> {
        BackupInfo::from_path(&self.local_archive(name)?)
    }

    pub fn delete_backup(&self, name: &str) -> Result<()> {
        let path = self.local_archive(name)?;
        fs::remove_file(&path)?;
        info!("Deleted backup {}", path.display());
        Ok(())
    }

    /// Copies `source` into the backups directory as `name` (default: its file
    /// name), so it can be restored like a local backup.
    pub fn import_backup(&self, source: &Path, name: Option<&str>) -> Result<BackupInfo> {
        let _job = self.job.try_lock().map_err(|_| AppError::Busy)?;
        self.import_file(source, name)
    }

    fn import_file(&self, source: &Path, name: Option<&str>) -> Result<BackupInfo> {
        let name = match name {
            Some(name) => name.to_string(),
            None => source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        let name = validate_backup_name(&name)?;
        if !source.is_file() {
            return Err(AppError::NotFound(format!("file {}", source.display())));
        }

        fs::create_dir_all(&self.ctx.backups_dir)?;
        let dest = self.ctx.backups_dir.join(name);
        let mut staging = NamedTempFile::new_in(&self.ctx.backups_dir)?;
        let mut input = fs::File::open(source)?;
        std::io::copy(&mut input, staging.as_file_mut())?;
        staging.persist(&dest).map_err(|e| e.error)?;
        info!("Imported {} as {}", source.display(), name);
        BackupInfo::from_path(&dest)
    }

    /// Uploads an existing local archive to one enabled target.
    pub async fn push_backup(&self, name: &str, target_id: i32) -> Result<()> {
        let path = self.local_archive(name)?;
        let target = self.ctx.registry.require_enabled(target_id).await?;
        let spec = target.to_spec()?;
        self.ctx.transfer.build_config(std::slice::from_ref(&spec)).await?;

        let transfer = self.ctx.transfer.as_ref();
        let (path, spec) = (&path, &spec);
        retry_async(&self.ctx.retry, move |_| transfer.copy_to(path, spec), |e| e.is_transient()).await?;
        info!("Pushed {} to {}", name, target.name);
        Ok(())
    }

    /// Downloads `name` from one enabled target into the backups directory.
    pub async fn pull_backup(&self, name: &str, target_id: i32) -> Result<BackupInfo> {
        let _job = self.job.try_lock().map_err(|_| AppError::Busy)?;
        let name = validate_backup_name(name)?;
        let target = self.ctx.registry.require_enabled(target_id).await?;
        let spec = target.to_spec()?;
        self.ctx.transfer.build_config(std::slice::from_ref(&spec)).await?;

        fs::create_dir_all(&self.ctx.backups_dir)?;
        let staging = tempfile::Builder::new()
            .prefix(".pull-")
            .tempdir_in(&self.ctx.backups_dir)?;
        let downloaded = self.ctx.transfer.copy_from(&spec, name, staging.path()).await?;
        let dest = self.ctx.backups_dir.join(name);
        fs::rename(&downloaded, &dest)?;
        info!("Pulled {} from {}", name, target.name);
        BackupInfo::from_path(&dest)
    }

    /// File names stored on one enabled target.
    pub async fn list_remote(&self, target_id: i32) -> Result<Vec<String>> {
        let target = self.ctx.registry.require_enabled(target_id).await?;
        let spec = target.to_spec()?;
        self.ctx.transfer.build_config(std::slice::from_ref(&spec)).await?;
        self.ctx.transfer.list(&spec).await
    }

    fn local_archive(&self, name: &str) -> Result<PathBuf> {
        let name = validate_backup_name(name)?;
        let path = self.ctx.backups_dir.join(name);
        if !path.is_file() {
            return Err(AppError::NotFound(format!("backup {name}")));
        }
        Ok(path)
    }
}

/// Polls `status` until a terminal state or `timeout`.
pub async fn wait_for_terminal(status: &dyn StatusStore, poll: Duration, timeout: Duration) -> BackupStatus {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let current = status.read();
        if current.status.is_terminal() || tokio::time::Instant::now() >= deadline {
            return current;
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::JobState;
    use crate::testing::{TestHarness, target_payload};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_second_job_is_busy_and_status_untouched() -> anyhow::Result<()> {
        let h = TestHarness::new();
        let service = h.service();
        let _held = service.job.try_lock()?;

        let err = service.create_backup(&[]).await.unwrap_err();
        assert!(matches!(err, AppError::Busy));
        let err = service.restore_backup("a.tar.gz", "full").await.unwrap_err();
        assert!(matches!(err, AppError::Busy));
        assert!(h.status.history().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_import_and_pull_wait_for_the_job_slot() -> anyhow::Result<()> {
        let h = TestHarness::new();
        let service = h.service();
        let outside = h.root.path().join("incoming.tar.gz");
        fs::write(&outside, b"archive bytes")?;

        {
            let _held = service.job.try_lock()?;
            assert!(matches!(
                service.import_backup(&outside, None).unwrap_err(),
                AppError::Busy
            ));
            assert!(matches!(
                service.pull_backup("incoming.tar.gz", 1).await.unwrap_err(),
                AppError::Busy
            ));
            assert!(!h.backups_dir().join("incoming.tar.gz").exists());
        }

        let info = service.import_backup(&outside, None)?;
        assert_eq!(info.id, "incoming.tar.gz");
        Ok(())
    }

    #[tokio::test]
    async fn test_list_info_delete() -> anyhow::Result<()> {
        let h = TestHarness::new();
        let service = h.service();
        let outcome = service.create_backup(&[]).await?;
        fs::write(h.backups_dir().join("notes.txt"), b"not an archive")?;

        let list = service.list_backups()?;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, outcome.backup_name);
        assert!(list[0].size_bytes > 0);

        let info = service.backup_info(&outcome.backup_name)?;
        assert_eq!(info.path, outcome.path);

        service.delete_backup(&outcome.backup_name)?;
        assert!(service.list_backups()?.is_empty());
        assert!(matches!(
            service.delete_backup(&outcome.backup_name).unwrap_err(),
            AppError::NotFound(_)
        ));
        assert!(matches!(
            service.backup_info("../x.tar.gz").unwrap_err(),
            AppError::Validation(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_push_then_pull_round_trip() -> anyhow::Result<()> {
        let h = TestHarness::new();
        let service = h.service();
        let target = service.targets().upsert(target_payload("NAS", true)).await?;
        let outcome = service.create_backup(&[]).await?;
        let original = fs::read(&outcome.path)?;

        h.transfer.fail_uploads("NAS", 1);
        service.push_backup(&outcome.backup_name, target.id).await?;
        assert_eq!(h.transfer.upload_attempts("NAS"), 2);
        assert_eq!(service.list_remote(target.id).await?, vec![outcome.backup_name.clone()]);

        service.delete_backup(&outcome.backup_name)?;
        let pulled = service.pull_backup(&outcome.backup_name, target.id).await?;
        assert_eq!(fs::read(&pulled.path)?, original);
        assert_eq!(h.transfer.last_config(), Some(vec!["NAS".to_string()]));
        Ok(())
    }

    #[tokio::test]
    async fn test_disabled_or_unknown_target_rejected() -> anyhow::Result<()> {
        let h = TestHarness::new();
        let service = h.service();
        let target = service.targets().upsert(target_payload("Old", false)).await?;
        assert!(matches!(
            service.list_remote(target.id).await.unwrap_err(),
            AppError::Validation(_)
        ));
        assert!(matches!(
            service.pull_backup("a.tar.gz", 999).await.unwrap_err(),
            AppError::NotFound(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_import_and_restore() -> anyhow::Result<()> {
        let h = TestHarness::new();
        let service = h.service();
        let outcome = service.create_backup(&[]).await?;
        let outside = h.root.path().join("upload.bin");
        fs::copy(&outcome.path, &outside)?;

        let info = service
            .import_and_restore(&outside, Some("uploaded_restore.tar.gz"), "database")
            .await?;
        assert_eq!(info.id, "uploaded_restore.tar.gz");
        assert_eq!(h.database.restored_dumps().len(), 1);
        assert_eq!(service.status().status, JobState::Success);

        assert!(matches!(
            service.import_backup(&outside, Some("evil/../x.tar.gz")).unwrap_err(),
            AppError::Validation(_)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_for_terminal_returns_last_snapshot() {
        let store = Arc::new(crate::testing::RecordingStatusStore::default());
        store
            .write(&BackupStatus::new(JobState::Completed, 100, "done", Default::default()))
            .unwrap();
        let seen = wait_for_terminal(store.as_ref(), Duration::from_millis(1), Duration::from_millis(50)).await;
        assert_eq!(seen.status, JobState::Completed);
    }
}
