//! Remote transfer adapter: renders the rclone configuration for the enabled
//! targets and moves archives to and from them.

pub mod obscure;
pub mod providers;
pub mod smb;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::errors::{AppError, Result};
use crate::utils::command::run_tool;
pub use obscure::{RcloneObscurer, SecretObscurer};
pub use providers::{ProviderConfig, TargetKind};

pub const CONFIG_FILE_NAME: &str = "rclone.conf";

static SECTION_UNSAFE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9_-]").unwrap());

/// Config section name for a target called `name`.
pub fn section_name(name: &str) -> String {
    SECTION_UNSAFE.replace_all(name.trim(), "_").into_owned()
}

/// What the adapter needs to know about one target.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSpec {
    pub name: String,
    pub kind: TargetKind,
    pub remote_path: Option<String>,
    pub config: Map<String, Value>,
    pub enabled: bool,
}

impl TargetSpec {
    /// Config section name derived from the target name.
    pub fn section(&self) -> String {
        section_name(&self.name)
    }

    /// Folder on the remote, relative to the remote's root (or share).
    pub fn relative_path(&self) -> String {
        let raw = self.remote_path.as_deref().unwrap_or("").trim();
        match self.kind {
            TargetKind::Smb => {
                let share = self.config.get("share").and_then(Value::as_str).unwrap_or("");
                smb::share_relative_path(raw, share)
            }
            _ => raw.trim_matches('/').to_string(),
        }
    }

    /// `section:folder`, the remote directory argument.
    pub fn remote_dir(&self) -> String {
        format!("{}:{}", self.section(), self.relative_path())
    }

    /// `section:folder/file`, the remote file argument.
    pub fn remote_file(&self, filename: &str) -> String {
        let rel = self.relative_path();
        if rel.is_empty() {
            format!("{}:{}", self.section(), filename)
        } else {
            format!("{}:{}/{}", self.section(), rel, filename)
        }
    }
}

/// Operations against remote targets.
///
/// Implementations only return errors; retries, status updates and
/// notifications belong to the caller.
#[async_trait]
pub trait TransferTool: Send + Sync {
    /// Rewrites the whole configuration for exactly `targets`.
    async fn build_config(&self, targets: &[TargetSpec]) -> Result<()>;
    async fn copy_to(&self, local_file: &Path, target: &TargetSpec) -> Result<()>;
    async fn copy_from(&self, target: &TargetSpec, filename: &str, dest_dir: &Path) -> Result<PathBuf>;
    async fn list(&self, target: &TargetSpec) -> Result<Vec<String>>;
}

/// Renders the configuration file content for `targets`, skipping disabled ones.
///
/// Two targets whose names map to the same section are rejected.
pub async fn render_config(
    targets: &[TargetSpec],
    obscurer: &dyn SecretObscurer,
    allow_plaintext_secrets: bool,
) -> Result<String> {
    let mut out = String::new();
    let mut sections = HashSet::new();
    for target in targets.iter().filter(|t| t.enabled) {
        let name = target.name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("target name cannot be empty".into()));
        }
        if !sections.insert(target.section()) {
            return Err(AppError::Validation(format!(
                "target '{}' maps to configuration section [{}], already used by another target",
                name,
                target.section()
            )));
        }
        let provider = ProviderConfig::from_target(name, &target.kind, &target.config)?;
        let lines = provider
            .section_lines(name, &target.kind, obscurer, allow_plaintext_secrets)
            .await?;

        out.push_str(&format!("[{}]\n", target.section()));
        for (key, value) in lines {
            if key.contains(['\n', '\r', '=']) || value.contains(['\n', '\r']) {
                return Err(AppError::Validation(format!(
                    "configuration key '{}' of target '{}' contains a line break or '='",
                    key.escape_debug(),
                    name
                )));
            }
            out.push_str(&format!("{key} = {value}\n"));
        }
        out.push('\n');
    }
    Ok(out)
}

#[derive(Clone)]
pub struct RcloneTransfer {
    binary: PathBuf,
    config_path: PathBuf,
    obscurer: Arc<dyn SecretObscurer>,
    timeout: Duration,
    transfers: u32,
    allow_plaintext_secrets: bool,
}

impl RcloneTransfer {
    pub fn new(
        binary: PathBuf,
        config_dir: &Path,
        obscurer: Arc<dyn SecretObscurer>,
        timeout: Duration,
        transfers: u32,
        allow_plaintext_secrets: bool,
    ) -> Self {
        Self {
            binary,
            config_path: config_dir.join(CONFIG_FILE_NAME),
            obscurer,
            timeout,
            transfers: transfers.max(1),
            allow_plaintext_secrets,
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    async fn rclone(&self, args: Vec<String>) -> Result<String> {
        let label = format!("rclone {}", args.join(" "));
        let mut full = vec!["--config".to_string(), self.config_path.display().to_string()];
        full.extend(args);
        run_tool(&self.binary, &full, &label, self.timeout).await
    }
}

#[async_trait]
impl TransferTool for RcloneTransfer {
    async fn build_config(&self, targets: &[TargetSpec]) -> Result<()> {
        info!("Generating {} for {} target(s)", CONFIG_FILE_NAME, targets.len());
        let content = render_config(targets, self.obscurer.as_ref(), self.allow_plaintext_secrets).await?;

        let dir = match self.config_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let mut staging = NamedTempFile::new_in(&dir)?;
        staging.write_all(content.as_bytes())?;
        staging.persist(&self.config_path).map_err(|e| e.error)?;

        debug!("Wrote {}", self.config_path.display());
        Ok(())
    }

    async fn copy_to(&self, local_file: &Path, target: &TargetSpec) -> Result<()> {
        let filename = local_file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| AppError::Validation(format!("invalid local file: {}", local_file.display())))?;
        let dest = target.remote_file(filename);
        info!("Uploading {} to {} ({})", filename, target.name, dest);

        self.rclone(vec![
            "copyto".into(),
            local_file.display().to_string(),
            dest,
            "--checksum".into(),
            "--transfers".into(),
            self.transfers.to_string(),
        ])
        .await?;

        info!("Upload to {} completed", target.name);
        Ok(())
    }

    async fn copy_from(&self, target: &TargetSpec, filename: &str, dest_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dest_dir)?;
        let out = dest_dir.join(filename);
        info!("Downloading {} from {}", filename, target.name);

        self.rclone(vec![
            "copyto".into(),
            target.remote_file(filename),
            out.display().to_string(),
            "--checksum".into(),
            "--transfers".into(),
            self.transfers.to_string(),
        ])
        .await?;
        Ok(out)
    }

    async fn list(&self, target: &TargetSpec) -> Result<Vec<String>> {
        let out = self
            .rclone(vec!["lsf".into(), target.remote_dir(), "--files-only".into()])
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}
