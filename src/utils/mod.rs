pub mod command;
pub mod retry;

use std::path::{Path, PathBuf};
use url::Url;
use which::which;

use crate::errors::{AppError, Result};

/// Resolves an external executable, preferring an explicitly configured path
/// over a lookup in the system PATH.
pub fn find_executable(name: &str, configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        return Ok(path.to_path_buf());
    }
    which(name).map_err(|_| {
        AppError::Config(format!(
            "{name} executable not found in PATH. Please ensure it is installed or configure its path explicitly."
        ))
    })
}

/// Strips the password from a connection URL so it can be logged.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

/// Size in megabytes rounded to two decimals.
pub fn size_in_mb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}
