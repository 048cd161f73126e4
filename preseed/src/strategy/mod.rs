//! Recovery sources the orchestrator can seed a volume from.

mod local;
mod replica;
mod repository;

pub use local::LocalSnapshot;
pub use replica::{ReplicaPull, ReplicaSource, SshReplica};
pub use repository::RemoteRepository;

#[cfg(test)]
pub use replica::MockReplicaSource;

use async_trait::async_trait;
use thiserror::Error;

use common::RestoreMethod;
use restic::ResticError;
use ssh::SshError;
use zfs::ZfsError;

use crate::PreseedTarget;

#[derive(Error, Debug)]
pub enum StrategyError {
    /// The source cannot be used for this target; try the next one
    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),

    #[error("ZFS error: {0}")]
    Zfs(#[from] ZfsError),

    #[error("SSH error: {0}")]
    Ssh(#[from] SshError),

    #[error("restic error: {0}")]
    Restic(#[from] ResticError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StrategyError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        StrategyError::Unavailable(reason.into())
    }
}

/// One way of putting data back into an empty volume
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RestoreStrategy: Send + Sync {
    fn method(&self) -> RestoreMethod;

    /// Cheap check whether [`execute`](Self::execute) can work for `target`
    async fn precondition(&self, target: &PreseedTarget) -> Result<(), StrategyError>;

    /// Seeds the volume; returns a description of what was restored
    async fn execute(&self, target: &PreseedTarget) -> Result<String, StrategyError>;
}
