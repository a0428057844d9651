use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::utils::retry::RetryPolicy;

pub const DEFAULT_BACKUP_PREFIX: &str = "sistema54_complete_backup";
pub const DEFAULT_SETTINGS_TABLE: &str = "impostazioni_azienda";
pub const DEFAULT_COMPANY_NAME: &str = "GIT - Gestione Interventi Tecnici";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawToolsConfig {
    pub pg_dump: Option<PathBuf>,
    pub pg_restore: Option<PathBuf>,
    pub rclone: Option<PathBuf>,
    pub command_timeout_secs: Option<u64>,
    pub obscure_timeout_secs: Option<u64>,
    pub transfers: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRetryConfig {
    pub max_attempts: Option<u32>,
    pub backoff_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawNotificationConfig {
    pub recipient: Option<String>,
    pub company_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub database_url: Option<String>,
    pub backups_dir: Option<PathBuf>,
    pub uploads_dir: Option<PathBuf>,
    pub rclone_dir: Option<PathBuf>,
    pub backup_prefix: Option<String>,
    pub settings_table: Option<String>,
    pub tools: Option<RawToolsConfig>,
    pub upload_retry: Option<RawRetryConfig>,
    pub allow_plaintext_secret_fallback: Option<bool>,
    pub notifications: Option<RawNotificationConfig>,
}

impl RawJsonConfig {
    /// Environment variables win over the JSON values.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = var("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(dir) = var("BACKUPS_DIR") {
            self.backups_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = var("UPLOADS_DIR") {
            self.uploads_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = var("RCLONE_DIR") {
            self.rclone_dir = Some(PathBuf::from(dir));
        }
        if let Some(prefix) = var("BACKUP_PREFIX") {
            self.backup_prefix = Some(prefix);
        }
    }
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct ToolsConfig {
    pub pg_dump: Option<PathBuf>,
    pub pg_restore: Option<PathBuf>,
    pub rclone: Option<PathBuf>,
    pub command_timeout: Duration,
    pub obscure_timeout: Duration,
    pub transfers: u32,
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub recipient: Option<String>,
    pub company_name: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub backups_dir: PathBuf,
    pub uploads_dir: PathBuf,
    pub rclone_dir: PathBuf,
    pub backup_prefix: String,
    pub settings_table: String,
    pub tools: ToolsConfig,
    pub upload_retry: RetryPolicy,
    pub allow_plaintext_secret_fallback: bool,
    pub notifications: NotificationConfig,
}

impl AppConfig {
    /// Reads `config_path` (when it exists), applies environment overrides
    /// from `lookup` and validates the result.
    pub fn load(config_path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut raw = if config_path.exists() {
            Self::read_raw(config_path)?
        } else {
            info!(
                "No config file at {}, using defaults and environment",
                config_path.display()
            );
            RawJsonConfig::default()
        };
        raw.apply_env_overrides(lookup);
        Self::from_raw(raw)
    }

    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        Self::from_raw(Self::read_raw(config_path)?)
    }

    fn read_raw(config_path: &Path) -> Result<RawJsonConfig> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        serde_json::from_str(&config_content)
            .with_context(|| format!("Failed to parse JSON from config file at {}", config_path.display()))
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let database_url = raw
            .database_url
            .filter(|s| !s.trim().is_empty())
            .context("database_url must be set in config.json or DATABASE_URL")?;

        let backup_prefix = raw
            .backup_prefix
            .unwrap_or_else(|| DEFAULT_BACKUP_PREFIX.to_string());
        if backup_prefix.trim().is_empty() || backup_prefix.contains(['/', '\\']) {
            anyhow::bail!("backup_prefix must be a non-empty file name prefix, got {:?}", backup_prefix);
        }

        let tools = raw.tools.unwrap_or_default();
        let transfers = tools.transfers.unwrap_or(2);
        if transfers == 0 {
            anyhow::bail!("tools.transfers must be at least 1");
        }

        let retry = raw.upload_retry.unwrap_or_default();
        let defaults = RetryPolicy::default();
        let upload_retry = RetryPolicy {
            max_attempts: retry.max_attempts.unwrap_or(defaults.max_attempts),
            delay: retry.backoff_secs.map(Duration::from_secs).unwrap_or(defaults.delay),
        };
        if upload_retry.max_attempts == 0 {
            anyhow::bail!("upload_retry.max_attempts must be at least 1");
        }

        let notifications = raw.notifications.unwrap_or_default();

        Ok(AppConfig {
            database_url,
            backups_dir: raw.backups_dir.unwrap_or_else(|| PathBuf::from("./backups")),
            uploads_dir: raw.uploads_dir.unwrap_or_else(|| PathBuf::from("./uploads")),
            rclone_dir: raw.rclone_dir.unwrap_or_else(|| PathBuf::from("./rclone")),
            backup_prefix,
            settings_table: raw
                .settings_table
                .unwrap_or_else(|| DEFAULT_SETTINGS_TABLE.to_string()),
            tools: ToolsConfig {
                pg_dump: tools.pg_dump,
                pg_restore: tools.pg_restore,
                rclone: tools.rclone,
                command_timeout: Duration::from_secs(tools.command_timeout_secs.unwrap_or(300)),
                obscure_timeout: Duration::from_secs(tools.obscure_timeout_secs.unwrap_or(5)),
                transfers,
            },
            upload_retry,
            allow_plaintext_secret_fallback: raw.allow_plaintext_secret_fallback.unwrap_or(false),
            notifications: NotificationConfig {
                recipient: notifications.recipient.filter(|r| !r.trim().is_empty()),
                company_name: notifications
                    .company_name
                    .unwrap_or_else(|| DEFAULT_COMPANY_NAME.to_string()),
            },
        })
    }
}
