pub(crate) mod db_restore;
pub mod logic;
pub mod uploads;

pub use logic::{RestoreType, perform_restore_orchestration};
