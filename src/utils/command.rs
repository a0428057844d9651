use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error};

use crate::errors::{AppError, Result};

/// Runs an external tool to completion and returns its stdout.
///
/// `label` is what ends up in logs and errors instead of the raw argument
/// list, so callers can keep connection strings and secrets out of both.
/// The child is killed when `timeout` elapses.
pub async fn run_tool<I, S>(
    program: &Path,
    args: I,
    label: &str,
    timeout: Duration,
) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    debug!("Running command: {}", label);

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AppError::ExternalTool {
            command: label.to_string(),
            stdout: String::new(),
            stderr: format!("failed to start {}: {}", program.display(), e),
        })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            error!("Command timed out after {}s: {}", timeout.as_secs(), label);
            return Err(AppError::ExternalToolTimeout {
                command: label.to_string(),
                seconds: timeout.as_secs(),
            });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        error!("Command failed ({}): {}\nSTDERR: {}", output.status, label, stderr.trim());
        return Err(AppError::ExternalTool {
            command: label.to_string(),
            stdout,
            stderr,
        });
    }

    if !stdout.is_empty() {
        debug!("Command output: {}", stdout.chars().take(500).collect::<String>());
    }
    Ok(stdout)
}
