use config::{Config, Environment, File, FileFormat};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::model::{JobSpec, ReplicationPolicy, Repository, RetentionPolicy, ServiceConfig};

const CONFIG_PATHS: [&str; 3] = [
    "/etc/custodian/custodian.toml",
    "~/.config/custodian/custodian.toml",
    "custodian.toml",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration path {path}: {reason}")]
    Path { path: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CustodianConfig {
    /// Host name used in metric labels; detected at runtime when unset
    pub hostname: Option<String>,
    /// Textfile collector directory for status records
    pub status_dir: PathBuf,
    /// Runtime state: snapshot leases and per-job locks
    pub run_dir: PathBuf,
    /// Parent directory of snapshot clone mountpoints
    pub mount_base: PathBuf,
    pub cache_dir: PathBuf,
    /// Parent directory for restore-test scratch directories
    pub scratch_dir: PathBuf,
    /// State that must survive a reboot, such as unfinished preseeds
    pub state_dir: PathBuf,
    pub stale_after_hours: u64,
    pub status_retention_days: u64,
    pub binaries: Binaries,
    pub backup: BackupSettings,
    pub retention: RetentionPolicy,
    pub verification: VerificationSettings,
    pub notify: NotifyConfig,
    pub repositories: BTreeMap<String, Repository>,
    /// Replication policies keyed by the dataset they are declared on
    pub replication: BTreeMap<String, ReplicationPolicy>,
    pub services: BTreeMap<String, ServiceConfig>,
    pub jobs: BTreeMap<String, JobSpec>,
}

impl Default for CustodianConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            status_dir: PathBuf::from("/var/lib/node_exporter/textfile_collector"),
            run_dir: PathBuf::from("/run/custodian"),
            mount_base: PathBuf::from("/var/lib/custodian/snapshots"),
            cache_dir: PathBuf::from("/var/cache/restic"),
            scratch_dir: PathBuf::from("/var/tmp/custodian"),
            state_dir: PathBuf::from("/var/lib/custodian/state"),
            stale_after_hours: 26,
            status_retention_days: 30,
            binaries: Binaries::default(),
            backup: BackupSettings::default(),
            retention: RetentionPolicy::default(),
            verification: VerificationSettings::default(),
            notify: NotifyConfig::default(),
            repositories: BTreeMap::new(),
            replication: BTreeMap::new(),
            services: BTreeMap::new(),
            jobs: BTreeMap::new(),
        }
    }
}

/// External programs the engine drives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Binaries {
    pub restic: String,
    pub zfs: String,
    pub nice: String,
    pub ionice: String,
}

impl Default for Binaries {
    fn default() -> Self {
        Self {
            restic: "restic".to_string(),
            zfs: "zfs".to_string(),
            nice: "nice".to_string(),
            ionice: "ionice".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Attempts per job, transient failures only
    pub max_attempts: u32,
    pub retry_base_secs: u64,
    /// Upper bound of the random start delay
    pub jitter_secs: u64,
    /// Unreadable files tolerated before a partial run counts as failed
    pub partial_max_errors: u64,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_secs: 30,
            jitter_secs: 300,
            partial_max_errors: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationSettings {
    /// Passed to `restic check --read-data-subset`, e.g. `5%` or `1/10`
    pub read_data_subset: Option<String>,
    pub restore_test_samples: usize,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            read_data_subset: None,
            restore_test_samples: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Command (argv) run after a successful job
    pub on_success: Vec<String>,
    /// Command (argv) run after a failed job
    pub on_failure: Vec<String>,
    pub sentry_dsn: Option<String>,
}

impl CustodianConfig {
    /// Fills in derived fields after deserialisation
    fn normalize(mut self) -> Result<Self, ConfigError> {
        for (name, repository) in self.repositories.iter_mut() {
            repository.name = name.clone();
        }

        let mut replication = BTreeMap::new();
        for (dataset, policy) in std::mem::take(&mut self.replication) {
            let key = dataset.trim_matches('/').to_string();
            if key.is_empty() {
                return Err(ConfigError::Invalid(
                    "replication policy declared on an empty dataset path".to_string(),
                ));
            }
            if replication.insert(key.clone(), policy).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "replication policy for '{key}' declared twice"
                )));
            }
        }
        self.replication = replication;

        for (name, service) in self.services.iter_mut() {
            if let Some(dataset) = service.dataset.as_mut() {
                *dataset = dataset.trim_matches('/').to_string();
            }
            if service.preseed.as_ref().is_some_and(|p| p.enable) && service.dataset.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "service '{name}' enables preseed but declares no dataset"
                )));
            }
        }

        Ok(self)
    }

    pub fn repository(&self, name: &str) -> Option<&Repository> {
        self.repositories.get(name)
    }
}

fn base_builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
    let defaults = CustodianConfig::default();
    let builder = Config::builder()
        .set_default("status_dir", defaults.status_dir.to_string_lossy().into_owned())?
        .set_default("run_dir", defaults.run_dir.to_string_lossy().into_owned())?
        .set_default("mount_base", defaults.mount_base.to_string_lossy().into_owned())?
        .set_default("cache_dir", defaults.cache_dir.to_string_lossy().into_owned())?
        .set_default("scratch_dir", defaults.scratch_dir.to_string_lossy().into_owned())?
        .set_default("state_dir", defaults.state_dir.to_string_lossy().into_owned())?
        .set_default("stale_after_hours", defaults.stale_after_hours)?
        .set_default("status_retention_days", defaults.status_retention_days)?;
    Ok(builder)
}

fn expand(path: &str) -> Result<PathBuf, ConfigError> {
    shellexpand::full(path)
        .map(|p| PathBuf::from(p.into_owned()))
        .map_err(|e| ConfigError::Path {
            path: path.to_string(),
            reason: e.to_string(),
        })
}

/// Loads the layered configuration.
///
/// Sources, later ones overriding earlier ones:
/// 1. /etc/custodian/custodian.toml
/// 2. ~/.config/custodian/custodian.toml
/// 3. custodian.toml (current directory)
/// 4. `explicit`, which must exist when given
/// 5. `CUSTODIAN_*` environment variables (`__` separates nested keys)
pub fn load_config(explicit: Option<&Path>) -> Result<CustodianConfig, ConfigError> {
    let mut builder = base_builder()?;

    for path in CONFIG_PATHS {
        let path = expand(path)?;
        if path.exists() {
            debug!("Adding configuration source {}", path.display());
            builder = builder.add_source(File::new(&path.to_string_lossy(), FileFormat::Toml));
        }
    }

    if let Some(path) = explicit {
        let path = expand(&path.to_string_lossy())?;
        info!("Loading configuration from {}", path.display());
        builder = builder.add_source(File::new(&path.to_string_lossy(), FileFormat::Toml).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix("CUSTODIAN")
            .separator("__")
            .try_parsing(true),
    );

    let config: CustodianConfig = builder.build()?.try_deserialize()?;
    config.normalize()
}

/// Loads configuration from a TOML string, without files or environment
pub fn load_config_str(toml: &str) -> Result<CustodianConfig, ConfigError> {
    let config: CustodianConfig = base_builder()?
        .add_source(File::from_str(toml, FileFormat::Toml))
        .build()?
        .try_deserialize()?;
    config.normalize()
}
