//! Backup jobs, repository verification and restore tests on top of the
//! `restic` command line tool.

pub mod backup;
pub mod cli;
mod error;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod list;
pub mod lock;
pub mod notify;
pub mod report;
pub mod runner;
pub mod verify;
pub mod wrapper;

pub use backup::{BackupExecutor, BackupReport};
pub use error::{classify, FailureKind, ResticError};
pub use list::{ListFilter, SnapshotListing};
pub use notify::{Event, EventStatus, Notifier, Notifiers};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};
pub use wrapper::{BackupOutcome, BackupRequest, Restic, SnapshotFile, SnapshotInfo};

pub type Result<T> = std::result::Result<T, ResticError>;

/// Hostname used in metric labels
pub fn hostname(configured: Option<&str>) -> String {
    if let Some(name) = configured {
        return name.to_string();
    }
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
