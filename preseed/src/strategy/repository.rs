use async_trait::async_trait;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use common::{CustodianConfig, RestoreMethod};
use restic::wrapper::RepositoryState;
use restic::{CommandRunner, Restic, SnapshotInfo};

use super::{RestoreStrategy, StrategyError};
use crate::PreseedTarget;

/// Restores the newest snapshot tagged for the service from its restic
/// repository
pub struct RemoteRepository {
    config: CustodianConfig,
    runner: Arc<dyn CommandRunner>,
}

impl RemoteRepository {
    pub fn new(config: CustodianConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    fn restic(&self, target: &PreseedTarget) -> Result<Restic, StrategyError> {
        let repository = target
            .repository
            .clone()
            .ok_or_else(|| StrategyError::unavailable("no repository configured"))?;
        if !repository.password_file.exists() {
            return Err(StrategyError::unavailable(format!(
                "password file {} is missing",
                repository.password_file.display()
            )));
        }
        Ok(Restic::from_config(&self.config, repository, self.runner.clone()))
    }

    async fn latest(&self, restic: &Restic, target: &PreseedTarget) -> Result<SnapshotInfo, StrategyError> {
        let name = &restic.repository().name;
        match restic.cat_config().await {
            Ok(RepositoryState::Ready) => {}
            Ok(RepositoryState::Missing) => {
                return Err(StrategyError::unavailable(format!(
                    "repository {name} does not exist"
                )))
            }
            Err(e) => {
                return Err(StrategyError::unavailable(format!(
                    "repository {name} unreachable: {e}"
                )))
            }
        }
        restic
            .latest_snapshot(&target.tags)
            .await?
            .ok_or_else(|| {
                StrategyError::unavailable(format!(
                    "repository {name} has no snapshot tagged {}",
                    target.tags.join(",")
                ))
            })
    }

    /// Path the service's data was recorded under: the snapshot clone for
    /// snapshot jobs, the live mountpoint otherwise
    fn recorded_path(&self, target: &PreseedTarget) -> PathBuf {
        match &target.job {
            Some(job) if job.use_snapshots => self.config.mount_base.join(&job.name),
            _ => target.mountpoint.clone(),
        }
    }
}

#[async_trait]
impl RestoreStrategy for RemoteRepository {
    fn method(&self) -> RestoreMethod {
        RestoreMethod::RemoteRepository
    }

    async fn precondition(&self, target: &PreseedTarget) -> Result<(), StrategyError> {
        let restic = self.restic(target)?;
        self.latest(&restic, target).await.map(|_| ())
    }

    async fn execute(&self, target: &PreseedTarget) -> Result<String, StrategyError> {
        let restic = self.restic(target)?;
        let snapshot = self.latest(&restic, target).await?;
        let source = self.recorded_path(target);

        tokio::fs::create_dir_all(&target.mountpoint).await?;
        info!(
            "Restoring {}:{} into {}",
            snapshot.short_id,
            source.display(),
            target.mountpoint.display()
        );
        restic
            .restore(&snapshot.id, Some(&source), &target.mountpoint, &[])
            .await?;
        Ok(format!(
            "restored snapshot {} from {}",
            snapshot.short_id,
            restic.repository().name
        ))
    }
}
