//! Backup/restore orchestration for a PostgreSQL-backed application: full
//! archives (database dump, uploads, settings, manifest), multi-destination
//! sync through rclone, and a persisted job status.

pub mod backup;
pub mod config;
pub mod database;
pub mod errors;
pub mod notify;
pub mod restore;
pub mod service;
pub mod status;
pub mod targets;
pub mod transfer;
pub mod utils;

#[cfg(test)]
mod testing;

pub use errors::{AppError, Result};
pub use service::{BackupInfo, BackupService, ServiceContext};
