pub mod archive;
pub(crate) mod db_dump;
pub mod logic;
pub mod naming;

pub use logic::{BackupOutcome, perform_backup_orchestration};
pub use naming::{backup_file_name, validate_backup_name};

/// Members of a complete backup archive.
pub const DB_DUMP: &str = "db.dump";
pub const UPLOADS_ARCHIVE: &str = "uploads.tar.gz";
pub const SETTINGS_FILE: &str = "settings.json";
pub const MANIFEST_FILE: &str = "manifest.json";

pub const ARCHIVE_MEMBERS: [&str; 4] = [DB_DUMP, UPLOADS_ARCHIVE, SETTINGS_FILE, MANIFEST_FILE];

/// Top-level folder inside the nested uploads archive.
pub const UPLOADS_ROOT: &str = "uploads";
