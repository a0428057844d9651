//! In-memory stand-ins for the external collaborators, shared by the unit tests.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use crate::database::DatabaseOps;
use crate::errors::{AppError, Result};
use crate::notify::{BackupReport, Mailer, Notifier};
use crate::service::{BackupService, ServiceContext};
use crate::status::{BackupStatus, StatusStore};
use crate::targets::{BackupTarget, TargetPayload, TargetRecord, TargetRegistry, TargetStore};
use crate::transfer::{SecretObscurer, TargetSpec, TransferTool};
use crate::utils::retry::RetryPolicy;

pub const FAKE_DUMP: &[u8] = b"PGDMP fake custom-format dump";

fn tool_error(command: &str, stderr: &str) -> AppError {
    AppError::ExternalTool {
        command: command.to_string(),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

#[derive(Debug, Default)]
pub struct FakeObscurer {
    fail: bool,
}

impl FakeObscurer {
    pub fn failing() -> Self {
        Self { fail: true }
    }
}

#[async_trait]
impl SecretObscurer for FakeObscurer {
    async fn obscure(&self, secret: &str) -> Result<String> {
        if self.fail {
            return Err(tool_error("rclone obscure ***", "rclone: not found"));
        }
        Ok(format!("obscured({secret})"))
    }
}

pub struct FakeDatabase {
    fail_dump: bool,
    settings: Option<Map<String, Value>>,
    terminate_calls: AtomicU32,
    restored_dumps: Mutex<Vec<Vec<u8>>>,
    restored_settings: Mutex<Vec<Map<String, Value>>>,
}

impl Default for FakeDatabase {
    fn default() -> Self {
        let settings = json!({"id": 1, "nome_azienda": "ACME", "email": "ops@example.com"});
        Self {
            fail_dump: false,
            settings: settings.as_object().cloned(),
            terminate_calls: AtomicU32::new(0),
            restored_dumps: Mutex::new(Vec::new()),
            restored_settings: Mutex::new(Vec::new()),
        }
    }
}

impl FakeDatabase {
    pub fn failing_dump() -> Self {
        Self {
            fail_dump: true,
            ..Self::default()
        }
    }

    pub fn without_settings() -> Self {
        Self {
            settings: None,
            ..Self::default()
        }
    }

    pub fn restored_dumps(&self) -> Vec<Vec<u8>> {
        self.restored_dumps.lock().unwrap().clone()
    }

    pub fn restored_settings(&self) -> Vec<Map<String, Value>> {
        self.restored_settings.lock().unwrap().clone()
    }

    pub fn terminate_calls(&self) -> u32 {
        self.terminate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatabaseOps for FakeDatabase {
    async fn dump(&self, dest: &Path) -> Result<()> {
        if self.fail_dump {
            return Err(tool_error(
                "pg_dump -Fc",
                "pg_dump: error: connection to server failed: Connection refused",
            ));
        }
        fs::write(dest, FAKE_DUMP)?;
        Ok(())
    }

    async fn settings_snapshot(&self) -> Result<Map<String, Value>> {
        self.settings
            .clone()
            .ok_or_else(|| AppError::NotFound("settings table".to_string()))
    }

    async fn terminate_other_sessions(&self) -> Result<u64> {
        self.terminate_calls.fetch_add(1, Ordering::SeqCst);
        Err(AppError::Validation("must be a member of pg_signal_backend".to_string()))
    }

    async fn restore_dump(&self, dump: &Path) -> Result<()> {
        let bytes = fs::read(dump)?;
        self.restored_dumps.lock().unwrap().push(bytes);
        Ok(())
    }

    async fn restore_settings(&self, settings: &Map<String, Value>) -> Result<()> {
        self.restored_settings.lock().unwrap().push(settings.clone());
        Ok(())
    }
}

/// Transfer tool backed by a local directory per target section.
pub struct FakeTransfer {
    remote: TempDir,
    fail_config: bool,
    failures: Mutex<HashMap<String, u32>>,
    rejected: Mutex<HashSet<String>>,
    attempts: Mutex<HashMap<String, u32>>,
    configs: Mutex<Vec<Vec<String>>>,
}

impl Default for FakeTransfer {
    fn default() -> Self {
        Self {
            remote: tempfile::tempdir().expect("remote scratch dir"),
            fail_config: false,
            failures: Mutex::new(HashMap::new()),
            rejected: Mutex::new(HashSet::new()),
            attempts: Mutex::new(HashMap::new()),
            configs: Mutex::new(Vec::new()),
        }
    }
}

impl FakeTransfer {
    pub fn with_failing_config(mut self) -> Self {
        self.fail_config = true;
        self
    }

    /// The next `times` uploads to `target` fail with a tool error.
    pub fn fail_uploads(&self, target: &str, times: u32) {
        self.failures.lock().unwrap().insert(target.to_string(), times);
    }

    /// Every upload to `target` fails with an error that is not worth retrying.
    pub fn reject_uploads(&self, target: &str) {
        self.rejected.lock().unwrap().insert(target.to_string());
    }

    pub fn upload_attempts(&self, target: &str) -> u32 {
        self.attempts.lock().unwrap().get(target).copied().unwrap_or(0)
    }

    /// Target names of the last configuration built.
    pub fn last_config(&self) -> Option<Vec<String>> {
        self.configs.lock().unwrap().last().cloned()
    }

    pub fn remote_dir(&self, target: &TargetSpec) -> PathBuf {
        self.remote.path().join(target.section()).join(target.relative_path())
    }

    pub fn put_remote(&self, target: &TargetSpec, filename: &str, bytes: &[u8]) -> Result<()> {
        let dir = self.remote_dir(target);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(filename), bytes)?;
        Ok(())
    }
}

#[async_trait]
impl TransferTool for FakeTransfer {
    async fn build_config(&self, targets: &[TargetSpec]) -> Result<()> {
        if self.fail_config {
            return Err(tool_error("rclone obscure ***", "rclone: not found"));
        }
        let names = targets.iter().filter(|t| t.enabled).map(|t| t.name.clone()).collect();
        self.configs.lock().unwrap().push(names);
        Ok(())
    }

    async fn copy_to(&self, local_file: &Path, target: &TargetSpec) -> Result<()> {
        *self.attempts.lock().unwrap().entry(target.name.clone()).or_insert(0) += 1;
        if self.rejected.lock().unwrap().contains(&target.name) {
            return Err(AppError::Validation("remote rejected the file".to_string()));
        }
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&target.name).filter(|left| **left > 0) {
                *left -= 1;
                return Err(tool_error(
                    "rclone copyto",
                    "2024/01/01 ERROR : backup.tar.gz: Failed to copy: connection reset by peer",
                ));
            }
        }
        let filename = local_file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| AppError::Validation("bad local file".to_string()))?;
        let bytes = fs::read(local_file)?;
        self.put_remote(target, filename, &bytes)
    }

    async fn copy_from(&self, target: &TargetSpec, filename: &str, dest_dir: &Path) -> Result<PathBuf> {
        let src = self.remote_dir(target).join(filename);
        if !src.is_file() {
            return Err(tool_error("rclone copyto", "ERROR : directory not found"));
        }
        fs::create_dir_all(dest_dir)?;
        let out = dest_dir.join(filename);
        fs::copy(&src, &out)?;
        Ok(out)
    }

    async fn list(&self, target: &TargetSpec) -> Result<Vec<String>> {
        let dir = self.remote_dir(target);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }
}

#[derive(Default)]
pub struct MemoryTargetStore {
    rows: Mutex<Vec<BackupTarget>>,
    next_id: AtomicI32,
}

impl MemoryTargetStore {
    fn row(id: i32, record: &TargetRecord) -> BackupTarget {
        BackupTarget {
            id,
            name: record.name.clone(),
            kind: record.kind.clone(),
            remote_path: record.remote_path.clone(),
            config: record.config.clone(),
            enabled: record.enabled,
            created_at: None,
            updated_at: None,
        }
    }
}

#[async_trait]
impl TargetStore for MemoryTargetStore {
    async fn list(&self) -> Result<Vec<BackupTarget>> {
        Ok(self.rows.lock().unwrap().clone())
    }

    async fn get(&self, id: i32) -> Result<Option<BackupTarget>> {
        Ok(self.rows.lock().unwrap().iter().find(|t| t.id == id).cloned())
    }

    async fn name_taken(&self, name: &str, exclude_id: Option<i32>) -> Result<bool> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .any(|t| t.name == name && Some(t.id) != exclude_id))
    }

    async fn insert(&self, record: &TargetRecord) -> Result<BackupTarget> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let row = Self::row(id, record);
        self.rows.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn update(&self, id: i32, record: &TargetRecord) -> Result<Option<BackupTarget>> {
        let mut rows = self.rows.lock().unwrap();
        Ok(rows.iter_mut().find(|t| t.id == id).map(|t| {
            *t = Self::row(id, record);
            t.clone()
        }))
    }

    async fn delete(&self, id: i32) -> Result<bool> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|t| t.id != id);
        Ok(rows.len() != before)
    }
}

/// Status store that keeps every snapshot written.
#[derive(Default)]
pub struct RecordingStatusStore {
    history: Mutex<Vec<BackupStatus>>,
}

impl RecordingStatusStore {
    pub fn history(&self) -> Vec<BackupStatus> {
        self.history.lock().unwrap().clone()
    }
}

impl StatusStore for RecordingStatusStore {
    fn write(&self, status: &BackupStatus) -> Result<()> {
        self.history.lock().unwrap().push(status.clone());
        Ok(())
    }

    fn read(&self) -> BackupStatus {
        self.history
            .lock()
            .unwrap()
            .last()
            .cloned()
            .unwrap_or_else(BackupStatus::idle)
    }
}

#[derive(Clone, Default)]
pub struct RecordingMailer {
    sent: Arc<Mutex<Vec<(String, String, String)>>>,
}

impl RecordingMailer {
    /// `(to, subject, body)` of every e-mail sent.
    pub fn sent(&self) -> Vec<(String, String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), subject.to_string(), body.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    fail: bool,
    reports: Mutex<Vec<BackupReport>>,
}

impl RecordingNotifier {
    /// Records the report, then fails as an unreachable mail server would.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn reports(&self) -> Vec<BackupReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, report: &BackupReport) -> Result<()> {
        self.reports.lock().unwrap().push(report.clone());
        if self.fail {
            return Err(AppError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "smtp unreachable",
            )));
        }
        Ok(())
    }
}

/// A service context wired to the fakes above, rooted in a scratch directory.
pub struct TestHarness {
    pub root: TempDir,
    pub ctx: ServiceContext,
    pub database: Arc<FakeDatabase>,
    pub transfer: Arc<FakeTransfer>,
    pub status: Arc<RecordingStatusStore>,
    pub notifier: Arc<RecordingNotifier>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_database(FakeDatabase::default())
    }

    pub fn with_database(database: FakeDatabase) -> Self {
        Self::with(database, RecordingNotifier::default())
    }

    pub fn with(database: FakeDatabase, notifier: RecordingNotifier) -> Self {
        let root = tempfile::tempdir().expect("scratch dir");
        let database = Arc::new(database);
        let transfer = Arc::new(FakeTransfer::default());
        let status = Arc::new(RecordingStatusStore::default());
        let notifier = Arc::new(notifier);
        let ctx = ServiceContext {
            backups_dir: root.path().join("backups"),
            uploads_dir: root.path().join("uploads"),
            backup_prefix: "test_backup".to_string(),
            retry: RetryPolicy {
                max_attempts: 3,
                delay: std::time::Duration::ZERO,
            },
            database: database.clone(),
            transfer: transfer.clone(),
            status: status.clone(),
            notifier: notifier.clone(),
            registry: TargetRegistry::new(Arc::new(MemoryTargetStore::default()), transfer.clone()),
        };
        Self {
            root,
            ctx,
            database,
            transfer,
            status,
            notifier,
        }
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.ctx.backups_dir.clone()
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.ctx.uploads_dir.clone()
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.ctx.registry
    }

    pub fn service(&self) -> BackupService {
        BackupService::new(self.ctx.clone())
    }
}

/// An SMB target payload with a valid configuration.
pub fn target_payload(name: &str, enabled: bool) -> TargetPayload {
    TargetPayload {
        name: Some(name.to_string()),
        kind: Some("smb".to_string()),
        remote_path: Some("//192.168.1.10/BackupShare/2024".to_string()),
        enabled: Some(enabled),
        config: Some(json!({"host": "192.168.1.10", "share": "BackupShare", "user": "backup"})),
        ..TargetPayload::default()
    }
}
