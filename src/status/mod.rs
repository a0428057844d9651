//! Single-slot job status shared between the running backup/restore and
//! whoever polls for progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::errors::Result;

pub const STATUS_FILE_NAME: &str = "backup_status.json";

const RESERVED_KEYS: [&str; 4] = ["status", "progress", "message", "updated_at"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Idle,
    Running,
    Completed,
    Success,
    Error,
}

impl JobState {
    /// `completed`, `success` and `error` end a poll loop.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Success | JobState::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupStatus {
    pub status: JobState,
    pub progress: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BackupStatus {
    pub fn new(status: JobState, progress: u8, message: impl Into<String>, extra: Map<String, Value>) -> Self {
        let extra = extra
            .into_iter()
            .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
            .collect();
        Self {
            status,
            progress: progress.min(100),
            message: message.into(),
            updated_at: Some(Utc::now()),
            extra,
        }
    }

    /// What pollers see when nothing has run yet or the record is unreadable.
    pub fn idle() -> Self {
        Self {
            status: JobState::Idle,
            progress: 0,
            message: "No operation running".to_string(),
            updated_at: None,
            extra: Map::new(),
        }
    }
}

/// Persistent single-slot status record.
///
/// `write` replaces the whole snapshot; `read` never fails and falls back to
/// [`BackupStatus::idle`].
pub trait StatusStore: Send + Sync {
    fn write(&self, status: &BackupStatus) -> Result<()>;
    fn read(&self) -> BackupStatus;
}

/// Status record kept as a JSON file, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct FileStatusStore {
    path: PathBuf,
}

impl FileStatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Status file inside a backups directory.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(STATUS_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StatusStore for FileStatusStore {
    fn write(&self, status: &BackupStatus) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let mut staging = NamedTempFile::new_in(&dir)?;
        staging.write_all(serde_json::to_string_pretty(status)?.as_bytes())?;
        staging.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    fn read(&self) -> BackupStatus {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return BackupStatus::idle(),
        };
        match serde_json::from_str(&raw) {
            Ok(status) => status,
            Err(e) => {
                warn!("Ignoring unreadable status file {}: {}", self.path.display(), e);
                BackupStatus::idle()
            }
        }
    }
}

/// Writes the snapshots of a single backup or restore run.
///
/// `base` keys (the backup id, the restore type) are repeated in every
/// snapshot. Running progress never moves backwards. A failed write is logged
/// and the run goes on.
pub struct RunReporter {
    store: Arc<dyn StatusStore>,
    base: Map<String, Value>,
    last_progress: u8,
}

impl RunReporter {
    pub fn new(store: Arc<dyn StatusStore>, base: Map<String, Value>) -> Self {
        Self {
            store,
            base,
            last_progress: 0,
        }
    }

    pub fn running(&mut self, progress: u8, message: &str) {
        let progress = progress.max(self.last_progress);
        self.last_progress = progress;
        self.write(JobState::Running, progress, message, Map::new());
    }

    pub fn finish(&mut self, state: JobState, progress: u8, message: &str, extra: Map<String, Value>) {
        self.write(state, progress, message, extra);
    }

    fn write(&self, state: JobState, progress: u8, message: &str, extra: Map<String, Value>) {
        let mut merged = self.base.clone();
        merged.extend(extra);
        if let Err(e) = self.store.write(&BackupStatus::new(state, progress, message, merged)) {
            warn!("Could not persist job status ({}): {}", message, e);
        }
    }
}
