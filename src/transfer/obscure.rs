use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{AppError, Result};
use crate::utils::command::run_tool;

/// Reversible encoding the transfer tool requires for passwords stored in its
/// configuration file.
#[async_trait]
pub trait SecretObscurer: Send + Sync {
    async fn obscure(&self, secret: &str) -> Result<String>;
}

/// `rclone obscure <secret>`.
#[derive(Debug, Clone)]
pub struct RcloneObscurer {
    binary: PathBuf,
    timeout: Duration,
}

impl RcloneObscurer {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }
}

#[async_trait]
impl SecretObscurer for RcloneObscurer {
    async fn obscure(&self, secret: &str) -> Result<String> {
        // The label keeps the secret out of logs and error messages.
        let out = run_tool(&self.binary, ["obscure", secret], "rclone obscure ***", self.timeout).await?;
        let obscured = out.trim();
        if obscured.is_empty() {
            return Err(AppError::ExternalTool {
                command: "rclone obscure ***".to_string(),
                stdout: String::new(),
                stderr: "empty output".to_string(),
            });
        }
        Ok(obscured.to_string())
    }
}
