//! Repository integrity checks and sampled restore tests.

mod check;

pub use check::CheckReport;
pub use restore_test::RestoreTestReport;

use std::sync::Arc;

use common::{CustodianConfig, Repository};
use metrics::{Labels, StatusWriter};

use crate::notify::{Event, EventStatus, Notifier, Notifiers};
use crate::runner::{CommandRunner, SystemRunner};
use crate::wrapper::Restic;
use crate::{Result, ResticError};

pub struct Verifier {
    config: CustodianConfig,
    runner: Arc<dyn CommandRunner>,
    status: StatusWriter,
    notifier: Arc<dyn Notifier>,
    hostname: String,
}

impl Verifier {
    pub fn new(config: CustodianConfig, runner: Arc<dyn CommandRunner>, notifier: Arc<dyn Notifier>) -> Self {
        let status = StatusWriter::new(config.status_dir.clone());
        let hostname = crate::hostname(config.hostname.as_deref());
        Self {
            config,
            runner,
            status,
            notifier,
            hostname,
        }
    }

    pub fn from_config(config: &CustodianConfig) -> Self {
        let runner = SystemRunner::new(config.binaries.nice.clone(), config.binaries.ionice.clone());
        Self::new(
            config.clone(),
            Arc::new(runner),
            Arc::new(Notifiers::from_config(&config.notify)),
        )
    }

    pub fn repository(&self, name: &str) -> Result<Repository> {
        self.config
            .repository(name)
            .cloned()
            .ok_or_else(|| ResticError::UnknownRepository(name.to_string()))
    }

    /// Every configured repository, in name order
    pub fn repositories(&self) -> Vec<Repository> {
        self.config.repositories.values().cloned().collect()
    }

    fn restic(&self, repository: Repository) -> Restic {
        Restic::from_config(&self.config, repository, self.runner.clone())
    }

    fn labels(&self, repository: &Repository) -> Labels {
        Labels::new()
            .with("repository", repository.name.as_str())
            .with("repository_name", repository.display_name())
            .with("repository_location", repository.location())
            .with("hostname", self.hostname.as_str())
    }

    async fn notify(&self, operation: &str, repository: &Repository, result: std::result::Result<String, String>, duration_secs: f64) {
        let (status, message) = match result {
            Ok(message) => (EventStatus::Success, message),
            Err(message) => (EventStatus::Failure, message),
        };
        self.notifier
            .notify(&Event {
                operation: operation.to_string(),
                subject: repository.name.clone(),
                repository: Some(repository.name.clone()),
                status,
                message,
                duration_secs,
            })
            .await;
    }
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}
