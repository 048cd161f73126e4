pub mod config;
pub mod model;
pub mod registry;
pub mod topology;

pub use config::{load_config, load_config_str, ConfigError, CustodianConfig};
pub use model::{
    BackupJob, IoClass, JobOrigin, JobSpec, ReplicationPolicy, Repository, RepositoryKind,
    Resources, RestoreMethod, RetentionPolicy, ServiceBackup, ServiceConfig, ServicePreseed,
};
pub use registry::{is_valid_job_name, service_job_name, JobRegistry, JobRegistryBuilder, RegistryError};
pub use topology::{resolve, ResolvedReplication};
