use async_trait::async_trait;
use log::info;
use std::sync::Arc;

use common::RestoreMethod;
use zfs::{ZfsOps, SESSION_PREFIX};

use super::{RestoreStrategy, StrategyError};
use crate::PreseedTarget;

/// Rolls the dataset back to its newest snapshot. Backup session snapshots
/// are ignored.
pub struct LocalSnapshot {
    zfs: Arc<dyn ZfsOps>,
}

impl LocalSnapshot {
    pub fn new(zfs: Arc<dyn ZfsOps>) -> Self {
        Self { zfs }
    }

    fn latest(&self, target: &PreseedTarget) -> Result<String, StrategyError> {
        let dataset = target
            .dataset
            .as_deref()
            .ok_or_else(|| StrategyError::unavailable("service has no dataset"))?;
        if !self.zfs.dataset_exists(dataset)? {
            return Err(StrategyError::unavailable(format!(
                "dataset {dataset} does not exist"
            )));
        }
        self.zfs
            .list_snapshots(Some(dataset))?
            .into_iter()
            .filter(|snapshot| {
                snapshot
                    .split_once('@')
                    .is_some_and(|(ds, name)| ds == dataset && !name.starts_with(SESSION_PREFIX))
            })
            .last()
            .ok_or_else(|| StrategyError::unavailable(format!("{dataset} has no snapshots")))
    }
}

#[async_trait]
impl RestoreStrategy for LocalSnapshot {
    fn method(&self) -> RestoreMethod {
        RestoreMethod::LocalSnapshot
    }

    async fn precondition(&self, target: &PreseedTarget) -> Result<(), StrategyError> {
        self.latest(target).map(|_| ())
    }

    async fn execute(&self, target: &PreseedTarget) -> Result<String, StrategyError> {
        let snapshot = self.latest(target)?;
        info!("Rolling back to {snapshot}");
        self.zfs.rollback(&snapshot)?;
        if let Some(dataset) = target.dataset.as_deref() {
            if !self.zfs.is_mounted(dataset)? {
                self.zfs.mount(dataset)?;
            }
        }
        Ok(format!("rolled back to {snapshot}"))
    }
}
