//! Provider-specific sections of the transfer tool's configuration file.

use serde_json::{Map, Value};
use std::fmt;
use tracing::{debug, error, warn};

use super::obscure::SecretObscurer;
use crate::errors::{AppError, Result};

/// Aliases the UI and older data used for the canonical kinds.
const KIND_ALIASES: [(&str, &str); 7] = [
    ("drive", "gdrive"),
    ("google", "gdrive"),
    ("google_drive", "gdrive"),
    ("googledrive", "gdrive"),
    ("gdrive_rclone", "gdrive"),
    ("onedrive_rclone", "onedrive"),
    ("dropbox_rclone", "dropbox"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind {
    GDrive,
    OneDrive,
    Dropbox,
    Smb,
    Ftp,
    Sftp,
    Other(String),
}

impl TargetKind {
    /// Lower-cases, folds aliases and maps to a variant. Empty input yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let lowered = raw.trim().to_lowercase();
        if lowered.is_empty() {
            return None;
        }
        let canonical = KIND_ALIASES
            .iter()
            .find(|(alias, _)| *alias == lowered)
            .map(|(_, kind)| (*kind).to_string())
            .unwrap_or(lowered);
        Some(match canonical.as_str() {
            "gdrive" => TargetKind::GDrive,
            "onedrive" => TargetKind::OneDrive,
            "dropbox" => TargetKind::Dropbox,
            "smb" => TargetKind::Smb,
            "ftp" => TargetKind::Ftp,
            "sftp" => TargetKind::Sftp,
            _ => TargetKind::Other(canonical),
        })
    }

    pub fn as_str(&self) -> &str {
        match self {
            TargetKind::GDrive => "gdrive",
            TargetKind::OneDrive => "onedrive",
            TargetKind::Dropbox => "dropbox",
            TargetKind::Smb => "smb",
            TargetKind::Ftp => "ftp",
            TargetKind::Sftp => "sftp",
            TargetKind::Other(kind) => kind,
        }
    }

    /// Backend name the transfer tool expects in `type = ...`.
    fn backend_type(&self) -> &str {
        match self {
            TargetKind::GDrive => "drive",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OAuthConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmbConfig {
    pub host: String,
    pub share: String,
    pub user: Option<String>,
    pub domain: Option<String>,
    pub port: Option<String>,
    pub pass: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpConfig {
    pub host: String,
    pub user: Option<String>,
    pub port: String,
    pub pass: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpConfig {
    pub host: String,
    pub user: String,
    pub port: String,
    pub key_file: Option<String>,
    pub key_file_pass: Option<String>,
    pub pass: Option<String>,
}

/// Validated, typed view of a target's opaque `config` map.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderConfig {
    GDrive(OAuthConfig),
    OneDrive {
        oauth: OAuthConfig,
        drive_id: Option<String>,
        drive_type: Option<String>,
    },
    Dropbox(OAuthConfig),
    Smb(SmbConfig),
    Ftp(FtpConfig),
    Sftp(SftpConfig),
    Other {
        kind: String,
        raw: Map<String, Value>,
    },
}

impl ProviderConfig {
    /// Checks the provider-mandatory fields of `config` for a target of `kind`.
    pub fn from_target(name: &str, kind: &TargetKind, config: &Map<String, Value>) -> Result<Self> {
        let parsed = match kind {
            TargetKind::GDrive => ProviderConfig::GDrive(oauth(config)),
            TargetKind::OneDrive => ProviderConfig::OneDrive {
                oauth: oauth(config),
                drive_id: field(config, "drive_id"),
                drive_type: field(config, "drive_type"),
            },
            TargetKind::Dropbox => ProviderConfig::Dropbox(oauth(config)),
            TargetKind::Smb => ProviderConfig::Smb(SmbConfig {
                host: required(config, "host", "SMB", name)?,
                share: required(config, "share", "SMB", name)?,
                user: field(config, "user"),
                domain: field(config, "domain"),
                port: field(config, "port"),
                pass: field(config, "pass"),
            }),
            TargetKind::Ftp => ProviderConfig::Ftp(FtpConfig {
                host: required(config, "host", "FTP", name)?,
                user: field(config, "user"),
                port: field(config, "port").unwrap_or_else(|| "21".to_string()),
                pass: field(config, "pass"),
            }),
            TargetKind::Sftp => ProviderConfig::Sftp(SftpConfig {
                host: required(config, "host", "SFTP", name)?,
                user: required(config, "user", "SFTP", name)?,
                port: field(config, "port").unwrap_or_else(|| "22".to_string()),
                key_file: field(config, "key_file"),
                key_file_pass: field(config, "key_file_pass"),
                pass: field(config, "pass"),
            }),
            TargetKind::Other(kind) => ProviderConfig::Other {
                kind: kind.clone(),
                raw: config.clone(),
            },
        };
        Ok(parsed)
    }

    /// Key/value lines of this provider's section, `type` first.
    ///
    /// Passwords are passed through `obscurer`. When that fails the build
    /// fails too, unless `allow_plaintext` is set, in which case the secret is
    /// written as-is and a security warning is logged.
    pub async fn section_lines(
        &self,
        name: &str,
        kind: &TargetKind,
        obscurer: &dyn SecretObscurer,
        allow_plaintext: bool,
    ) -> Result<Vec<(String, String)>> {
        let mut lines = vec![("type".to_string(), kind.backend_type().to_string())];
        let mut push = |key: &str, value: &Option<String>| {
            if let Some(v) = value {
                lines.push((key.to_string(), v.clone()));
            }
        };

        match self {
            ProviderConfig::GDrive(o) | ProviderConfig::Dropbox(o) => push_oauth(&mut push, o),
            ProviderConfig::OneDrive { oauth, drive_id, drive_type } => {
                push_oauth(&mut push, oauth);
                push("drive_id", drive_id);
                push("drive_type", drive_type);
            }
            ProviderConfig::Smb(smb) => {
                push("host", &Some(smb.host.clone()));
                push("share", &Some(smb.share.clone()));
                push("user", &smb.user);
                push("domain", &smb.domain);
                push("port", &smb.port);
                if let Some(pass) = &smb.pass {
                    let pass = obscure_secret(obscurer, pass, name, allow_plaintext).await?;
                    lines.push(("pass".to_string(), pass));
                }
            }
            ProviderConfig::Ftp(ftp) => {
                push("host", &Some(ftp.host.clone()));
                push("user", &ftp.user);
                push("port", &Some(ftp.port.clone()));
                if let Some(pass) = &ftp.pass {
                    let pass = obscure_secret(obscurer, pass, name, allow_plaintext).await?;
                    lines.push(("pass".to_string(), pass));
                }
            }
            ProviderConfig::Sftp(sftp) => {
                push("host", &Some(sftp.host.clone()));
                push("user", &Some(sftp.user.clone()));
                push("port", &Some(sftp.port.clone()));
                push("key_file", &sftp.key_file);
                push("key_file_pass", &sftp.key_file_pass);
                if let Some(pass) = &sftp.pass {
                    let pass = obscure_secret(obscurer, pass, name, allow_plaintext).await?;
                    lines.push(("pass".to_string(), pass));
                }
            }
            ProviderConfig::Other { kind, raw } => {
                warn!("Unsupported target type '{}' for '{}', writing a generic configuration", kind, name);
                for (key, value) in raw {
                    if let Some(v) = stringify(value) {
                        lines.push((key.clone(), v));
                    }
                }
            }
        }
        debug!("Configured {} target: {}", kind, name);
        Ok(lines)
    }
}

fn push_oauth(push: &mut impl FnMut(&str, &Option<String>), o: &OAuthConfig) {
    push("client_id", &o.client_id);
    push("client_secret", &o.client_secret);
    push("token", &o.token);
}

async fn obscure_secret(
    obscurer: &dyn SecretObscurer,
    secret: &str,
    name: &str,
    allow_plaintext: bool,
) -> Result<String> {
    match obscurer.obscure(secret).await {
        Ok(obscured) => Ok(obscured),
        Err(e) if allow_plaintext => {
            warn!(
                "SECURITY: could not obscure the password of target '{}' ({}); writing it in plaintext",
                name, e
            );
            Ok(secret.to_string())
        }
        Err(e) => {
            error!("Could not obscure the password of target '{}': {}", name, e);
            Err(e)
        }
    }
}

fn oauth(config: &Map<String, Value>) -> OAuthConfig {
    OAuthConfig {
        client_id: field(config, "client_id"),
        client_secret: field(config, "client_secret"),
        token: config.get("token").and_then(normalize_token),
    }
}

/// Tokens pasted as JSON text are re-serialized compactly; JSON objects are
/// serialized; anything else is used verbatim.
fn normalize_token(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(
            serde_json::from_str::<Value>(s)
                .ok()
                .filter(|v| v.is_object() || v.is_array())
                .map(|v| v.to_string())
                .unwrap_or_else(|| s.trim().to_string()),
        ),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn field(config: &Map<String, Value>, key: &str) -> Option<String> {
    config.get(key).and_then(stringify)
}

fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.trim().to_string()),
        other => Some(other.to_string()),
    }
}

fn required(config: &Map<String, Value>, key: &str, provider: &str, name: &str) -> Result<String> {
    field(config, key).ok_or_else(|| {
        AppError::Validation(format!("'{key}' is required for {provider} target '{name}'"))
    })
}
