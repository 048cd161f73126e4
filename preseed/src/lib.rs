//! Seeds an empty service volume before the service starts, trying replica
//! pull, local snapshot rollback and repository restore in order.

use std::path::PathBuf;
use thiserror::Error;

use common::{BackupJob, CustodianConfig, JobRegistry, RegistryError, Repository, RestoreMethod};

pub mod cli;
pub mod orchestrator;
pub mod strategy;

pub use orchestrator::{AttemptOutcome, Orchestrator, PreseedOutcome, RestoreAttempt};
pub use strategy::{RestoreStrategy, StrategyError};

#[derive(Error, Debug)]
pub enum PreseedError {
    #[error("Service '{0}' is not configured")]
    UnknownService(String),

    #[error("Service '{0}' has no mountpoint")]
    NoMountpoint(String),

    #[error("Every restore method failed: {}", describe(.0))]
    Exhausted(Vec<RestoreAttempt>),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Status record error: {0}")]
    Metrics(#[from] metrics::MetricsError),
}

fn describe(attempts: &[RestoreAttempt]) -> String {
    if attempts.is_empty() {
        return "no restore methods configured".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("{} ({})", a.method.as_str(), a.outcome))
        .collect::<Vec<_>>()
        .join("; ")
}

/// The service volume being seeded and where it could come from
#[derive(Debug, Clone)]
pub struct PreseedTarget {
    pub service: String,
    pub dataset: Option<String>,
    pub mountpoint: PathBuf,
    /// The service's backup job, when it has one
    pub job: Option<BackupJob>,
    pub repository: Option<Repository>,
    /// Tags selecting the service's snapshots in the repository
    pub tags: Vec<String>,
    /// Restore methods in the order they are tried
    pub methods: Vec<RestoreMethod>,
}

impl PreseedTarget {
    pub fn from_config(config: &CustodianConfig, service: &str) -> Result<Self, PreseedError> {
        let declared = config
            .services
            .get(service)
            .ok_or_else(|| PreseedError::UnknownService(service.to_string()))?;
        let mountpoint = declared
            .mountpoint
            .clone()
            .ok_or_else(|| PreseedError::NoMountpoint(service.to_string()))?;

        let registry = JobRegistry::from_config(config)?;
        let job = registry.for_service(service).cloned();

        let repository_name = declared
            .preseed
            .as_ref()
            .and_then(|p| p.repository.clone())
            .or_else(|| job.as_ref().map(|j| j.repository.clone()));
        let repository = match repository_name {
            Some(name) => config.repository(&name).cloned(),
            None => config.repositories.values().find(|r| r.primary).cloned(),
        };

        let tags = match &job {
            Some(job) if !job.tags.is_empty() => job.tags.clone(),
            _ => vec![service.to_string()],
        };
        let methods = declared
            .preseed
            .as_ref()
            .map(|p| p.methods.clone())
            .unwrap_or_else(RestoreMethod::all);

        Ok(Self {
            service: service.to_string(),
            dataset: declared.dataset.clone(),
            mountpoint,
            job,
            repository,
            tags,
            methods,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::path::Path;

    pub fn target(mountpoint: &Path) -> PreseedTarget {
        PreseedTarget {
            service: "sonarr".to_string(),
            dataset: Some("tank/services/sonarr".to_string()),
            mountpoint: mountpoint.to_path_buf(),
            job: None,
            repository: None,
            tags: vec!["sonarr".to_string()],
            methods: RestoreMethod::all(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::load_config_str;

    const CONFIG: &str = r#"
[repositories.nas]
url = "/mnt/nas/restic"
password_file = "/run/secrets/restic"
primary = true

[repositories.offsite]
url = "s3:https://example.r2.cloudflarestorage.com/restic"
password_file = "/run/secrets/restic-r2"

[services.sonarr]
dataset = "tank/services/sonarr"
mountpoint = "/var/lib/sonarr"

[services.sonarr.backup]
use_snapshots = true

[services.sonarr.preseed]
methods = ["local-snapshot", "remote-repository"]
repository = "offsite"

[services.grafana]
mountpoint = "/var/lib/grafana"
"#;

    #[test]
    fn test_target_from_service_declarations() {
        let config = load_config_str(CONFIG).unwrap();
        let target = PreseedTarget::from_config(&config, "sonarr").unwrap();
        assert_eq!(target.dataset.as_deref(), Some("tank/services/sonarr"));
        assert_eq!(target.mountpoint, PathBuf::from("/var/lib/sonarr"));
        assert_eq!(target.job.as_ref().map(|j| j.name.as_str()), Some("service-sonarr"));
        assert_eq!(target.repository.as_ref().map(|r| r.name.as_str()), Some("offsite"));
        assert_eq!(target.tags, vec!["sonarr".to_string()]);
        assert_eq!(
            target.methods,
            vec![RestoreMethod::LocalSnapshot, RestoreMethod::RemoteRepository]
        );
    }

    #[test]
    fn test_target_defaults() {
        let config = load_config_str(CONFIG).unwrap();
        let target = PreseedTarget::from_config(&config, "grafana").unwrap();
        assert!(target.job.is_none());
        assert_eq!(target.repository.as_ref().map(|r| r.name.as_str()), Some("nas"));
        assert_eq!(target.tags, vec!["grafana".to_string()]);
        assert_eq!(target.methods, RestoreMethod::all());
    }

    #[test]
    fn test_unknown_service() {
        let config = load_config_str(CONFIG).unwrap();
        assert!(matches!(
            PreseedTarget::from_config(&config, "plex"),
            Err(PreseedError::UnknownService(_))
        ));
    }
}
