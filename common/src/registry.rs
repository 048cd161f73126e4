use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::config::CustodianConfig;
use crate::model::{BackupJob, JobOrigin, JobSpec, Repository, Resources, ServiceBackup, ServiceConfig};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Backup job '{name}' is declared twice: by {first} and by {second}")]
    DuplicateJob {
        name: String,
        first: JobOrigin,
        second: JobOrigin,
    },

    #[error("Backup job '{job}' is missing required field '{field}'")]
    MissingField { job: String, field: &'static str },

    #[error("Backup job '{job}' references unknown repository '{repository}'")]
    UnknownRepository { job: String, repository: String },

    #[error("Backup job '{job}' names no repository and no primary repository is configured")]
    NoRepository { job: String },

    #[error("Invalid backup job name '{0}'")]
    InvalidJobName(String),

    #[error("More than one repository is marked primary: {0:?}")]
    MultiplePrimary(Vec<String>),
}

/// A job submitted to the builder before repositories are resolved
#[derive(Debug, Clone)]
struct Submission {
    spec: JobSpec,
    origin: JobOrigin,
}

/// Collects job contributions and materialises the validated registry.
///
/// Contributions are keyed by job name; a second contribution under the same
/// name is rejected instead of shadowing the first.
#[derive(Debug, Default)]
pub struct JobRegistryBuilder {
    submissions: BTreeMap<String, Submission>,
    default_resources: Resources,
}

impl JobRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_resources(mut self, resources: Resources) -> Self {
        self.default_resources = resources;
        self
    }

    /// Submits a named job record
    pub fn submit(
        &mut self,
        name: &str,
        spec: JobSpec,
        origin: JobOrigin,
    ) -> Result<&mut Self, RegistryError> {
        if !is_valid_job_name(name) {
            return Err(RegistryError::InvalidJobName(name.to_string()));
        }
        if let Some(existing) = self.submissions.get(name) {
            return Err(RegistryError::DuplicateJob {
                name: name.to_string(),
                first: existing.origin.clone(),
                second: origin,
            });
        }
        debug!("Registered backup job {name} from {origin}");
        self.submissions
            .insert(name.to_string(), Submission { spec, origin });
        Ok(self)
    }

    /// Derives a job from a service's own backup declaration
    pub fn contribute_service(
        &mut self,
        service: &str,
        config: &ServiceConfig,
        backup: &ServiceBackup,
    ) -> Result<&mut Self, RegistryError> {
        let paths = if backup.paths.is_empty() {
            config.mountpoint.iter().cloned().collect::<Vec<PathBuf>>()
        } else {
            backup.paths.clone()
        };
        let tags = if backup.tags.is_empty() {
            vec![service.to_string()]
        } else {
            backup.tags.clone()
        };

        let spec = JobSpec {
            repository: backup.repository.clone(),
            paths,
            tags,
            exclude: backup.exclude.clone(),
            frequency: backup.frequency.clone(),
            resources: backup.resources.clone(),
            use_snapshots: backup.use_snapshots,
            volume: config.dataset.clone(),
        };

        self.submit(
            &service_job_name(service),
            spec,
            JobOrigin::Service(service.to_string()),
        )
    }

    /// Adds a manually declared job
    pub fn declare(&mut self, name: &str, spec: JobSpec) -> Result<&mut Self, RegistryError> {
        self.submit(name, spec, JobOrigin::Manual)
    }

    /// Validates every submission and resolves repositories
    pub fn build(
        &self,
        repositories: &BTreeMap<String, Repository>,
    ) -> Result<JobRegistry, RegistryError> {
        let primaries: Vec<String> = repositories
            .values()
            .filter(|r| r.primary)
            .map(|r| r.name.clone())
            .collect();
        if primaries.len() > 1 {
            return Err(RegistryError::MultiplePrimary(primaries));
        }
        let fallback = primaries.first().cloned().or_else(|| {
            if repositories.len() == 1 {
                repositories.keys().next().cloned()
            } else {
                None
            }
        });

        let mut jobs = BTreeMap::new();
        for (name, submission) in &self.submissions {
            let spec = &submission.spec;

            if spec.paths.is_empty() {
                return Err(RegistryError::MissingField {
                    job: name.clone(),
                    field: "paths",
                });
            }
            if spec.use_snapshots && spec.volume.is_none() {
                return Err(RegistryError::MissingField {
                    job: name.clone(),
                    field: "volume",
                });
            }

            let repository = match &spec.repository {
                Some(repository) if repositories.contains_key(repository) => repository.clone(),
                Some(repository) => {
                    return Err(RegistryError::UnknownRepository {
                        job: name.clone(),
                        repository: repository.clone(),
                    })
                }
                None => fallback
                    .clone()
                    .ok_or_else(|| RegistryError::NoRepository { job: name.clone() })?,
            };

            jobs.insert(
                name.clone(),
                BackupJob {
                    name: name.clone(),
                    repository,
                    paths: spec.paths.clone(),
                    tags: if spec.tags.is_empty() {
                        vec![name.clone()]
                    } else {
                        spec.tags.clone()
                    },
                    exclude: spec.exclude.clone(),
                    frequency: spec.frequency.clone().unwrap_or_else(|| "daily".to_string()),
                    resources: spec
                        .resources
                        .clone()
                        .unwrap_or_else(|| self.default_resources.clone()),
                    use_snapshots: spec.use_snapshots,
                    volume: spec.volume.as_ref().map(|v| v.trim_matches('/').to_string()),
                    origin: submission.origin.clone(),
                },
            );
        }

        info!("Job registry materialised with {} jobs", jobs.len());
        Ok(JobRegistry { jobs })
    }
}

/// Job names end up in lock files, clone datasets and snapshot tags, so they
/// stay within `[A-Za-z0-9._-]` and never start with a dot.
pub fn is_valid_job_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Name of the job derived from a service declaration
pub fn service_job_name(service: &str) -> String {
    format!("service-{service}")
}

/// Validated name -> job map
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobRegistry {
    jobs: BTreeMap<String, BackupJob>,
}

impl JobRegistry {
    /// Builds the registry from service declarations and manual jobs
    pub fn from_config(config: &CustodianConfig) -> Result<Self, RegistryError> {
        let mut builder = JobRegistryBuilder::new();
        for (service, service_config) in &config.services {
            if let Some(backup) = service_config.backup.as_ref().filter(|b| b.enable) {
                builder.contribute_service(service, service_config, backup)?;
            }
        }
        for (name, spec) in &config.jobs {
            builder.declare(name, spec.clone())?;
        }
        builder.build(&config.repositories)
    }

    pub fn get(&self, name: &str) -> Option<&BackupJob> {
        self.jobs.get(name)
    }

    /// Job a service contributed, if it declared one
    pub fn for_service(&self, service: &str) -> Option<&BackupJob> {
        self.jobs.get(&service_job_name(service))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackupJob> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
