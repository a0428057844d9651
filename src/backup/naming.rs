use chrono::{DateTime, TimeZone};
use regex::Regex;
use std::fmt::Display;
use std::sync::LazyLock;

use crate::errors::{AppError, Result};

static BACKUP_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9._\-]+\.(tar\.gz|tgz|zip)$").unwrap());

/// `{prefix}_{YYYYmmdd_HHMMSS}.tar.gz`
pub fn backup_file_name<Tz>(prefix: &str, at: DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format!("{}_{}.tar.gz", prefix, at.format("%Y%m%d_%H%M%S"))
}

/// Accepts a bare archive file name; anything that could address another
/// path is rejected.
pub fn validate_backup_name(name: &str) -> Result<&str> {
    let name = name.trim();
    if name.is_empty() || name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(AppError::Validation(format!("invalid backup name: {name:?}")));
    }
    if !BACKUP_NAME.is_match(name) {
        return Err(AppError::Validation(format!("invalid backup name: {name:?}")));
    }
    Ok(name)
}
