//! Backup outcome notifications.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt::Write as _;
use tracing::{info, warn};

use crate::errors::Result;

/// Name of the implicit destination every completed backup lands on.
pub const LOCAL_DESTINATION: &str = "Local backup";

const MAX_ERROR_LEN: usize = 150;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DestinationResult {
    pub name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DestinationResult {
    pub fn ok(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: true,
            error: None,
        }
    }

    pub fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            success: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackupReport {
    Completed {
        backup_name: String,
        file_size_mb: f64,
        destinations: Vec<DestinationResult>,
    },
    Failed {
        error: String,
    },
    RestoreFailed {
        backup_name: String,
        restore_type: String,
        error: String,
    },
}

impl BackupReport {
    pub fn subject(&self, company_name: &str) -> String {
        match self {
            BackupReport::Completed { .. } => format!("Backup {company_name} - Completed"),
            BackupReport::Failed { .. } => format!("Backup {company_name} - Failed"),
            BackupReport::RestoreFailed { .. } => format!("Restore {company_name} - Failed"),
        }
    }

    pub fn body(&self) -> String {
        let mut body = String::new();
        match self {
            BackupReport::Completed {
                backup_name,
                file_size_mb,
                destinations,
            } => {
                let _ = writeln!(body, "Backup completed.");
                let _ = writeln!(body);
                let _ = writeln!(body, "File: {backup_name}");
                let _ = writeln!(body, "Size: {file_size_mb:.2} MB");
                let _ = writeln!(body);
                let _ = writeln!(body, "Destinations:");
                for dest in destinations {
                    match (&dest.success, &dest.error) {
                        (true, _) => {
                            let _ = writeln!(body, "  ✓ {}", dest.name);
                        }
                        (false, Some(err)) => {
                            let _ = writeln!(body, "  ✗ {}: {}", dest.name, err);
                        }
                        (false, None) => {
                            let _ = writeln!(body, "  ✗ {}", dest.name);
                        }
                    }
                }
            }
            BackupReport::Failed { error } => {
                let _ = writeln!(body, "Backup failed.");
                let _ = writeln!(body);
                let _ = writeln!(body, "Error: {}", summarize_error(error));
            }
            BackupReport::RestoreFailed {
                backup_name,
                restore_type,
                error,
            } => {
                let _ = writeln!(body, "Restore failed.");
                let _ = writeln!(body);
                let _ = writeln!(body, "File: {backup_name}");
                let _ = writeln!(body, "Type: {restore_type}");
                let _ = writeln!(body, "Error: {}", summarize_error(error));
            }
        }
        body
    }
}

/// Picks the most telling line of a possibly multi-line tool error: the first
/// line mentioning `ERROR` or `Failed`, reduced to the text after its last
/// colon, capped at 150 characters.
pub fn summarize_error(raw: &str) -> String {
    let line = raw
        .lines()
        .find(|l| l.contains("ERROR") || l.contains("Failed"))
        .map(|l| match l.rsplit_once(':') {
            Some((_, tail)) if !tail.trim().is_empty() => tail.trim(),
            _ => l.trim(),
        })
        .unwrap_or_else(|| raw.trim());

    if line.chars().count() > MAX_ERROR_LEN {
        let cut: String = line.chars().take(MAX_ERROR_LEN - 3).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}

/// E-mail sending primitive provided by the host application.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<()>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, report: &BackupReport) -> Result<()>;
}

/// Sends backup reports by e-mail. Without a recipient nothing is sent.
pub struct MailNotifier<M> {
    mailer: M,
    recipient: Option<String>,
    company_name: String,
}

impl<M: Mailer> MailNotifier<M> {
    pub fn new(mailer: M, recipient: Option<String>, company_name: impl Into<String>) -> Self {
        Self {
            mailer,
            recipient: recipient.filter(|r| !r.trim().is_empty()),
            company_name: company_name.into(),
        }
    }
}

#[async_trait]
impl<M: Mailer> Notifier for MailNotifier<M> {
    async fn notify(&self, report: &BackupReport) -> Result<()> {
        let Some(to) = &self.recipient else {
            warn!("No recipient configured for backup notifications");
            return Ok(());
        };
        self.mailer
            .send_email(to, &report.subject(&self.company_name), &report.body())
            .await?;
        info!("Backup notification sent to {}", to);
        Ok(())
    }
}

/// Mailer that only logs. Used by the CLI, where no SMTP transport exists.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        info!("Notification for {}: {}\n{}", to, subject, body);
        Ok(())
    }
}
