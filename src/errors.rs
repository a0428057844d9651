use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Path traversal attempt detected: '{member}' would be extracted outside '{dest}'")]
    PathTraversal { member: String, dest: String },

    #[error("Invalid backup archive: {0}")]
    InvalidArchive(String),

    #[error("Command failed: {command}\nSTDOUT: {stdout}\nSTDERR: {stderr}")]
    ExternalTool {
        command: String,
        stdout: String,
        stderr: String,
    },

    #[error("Command timed out after {seconds}s: {command}")]
    ExternalToolTimeout { command: String, seconds: u64 },

    #[error("Another backup or restore is already running")]
    Busy,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serde JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl AppError {
    /// Errors worth another attempt when talking to a remote target.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::ExternalTool { .. } | AppError::ExternalToolTimeout { .. } | AppError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
