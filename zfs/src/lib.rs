pub mod cli;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
pub mod session;
pub mod wrapper;

pub use session::{SnapshotLease, SnapshotManager, SnapshotSession, SESSION_PREFIX};
pub use wrapper::{Zfs, ZfsOps};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ZfsError {
    #[error("Failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("zfs {args} exited with status {status:?}: {stderr}")]
    Command {
        args: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Snapshot session for job {job} is held by running process {pid}")]
    SessionInUse { job: String, pid: i32 },

    #[error("Invalid job name for a snapshot session: '{0}'")]
    InvalidJobName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Status record error: {0}")]
    Metrics(#[from] metrics::MetricsError),
}

impl ZfsError {
    /// The command failed because the target dataset, snapshot or mount is already gone
    pub fn is_missing(&self) -> bool {
        match self {
            ZfsError::Command { stderr, .. } => {
                stderr.contains("does not exist")
                    || stderr.contains("not currently mounted")
                    || stderr.contains("could not find any snapshots")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ZfsError>;
