use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Backend type of a restic repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryKind {
    #[default]
    Local,
    Sftp,
    S3,
    B2,
    Rest,
    Rclone,
}

/// A backup destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Key of the repository in the configuration, filled in after loading
    #[serde(default)]
    pub name: String,
    pub url: String,
    pub password_file: PathBuf,
    /// Environment file carrying backend credentials (S3 keys and the like)
    #[serde(default)]
    pub environment_file: Option<PathBuf>,
    #[serde(default)]
    pub kind: RepositoryKind,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl Repository {
    /// Human facing name used in the `repository_name` label
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.display_name {
            return name.clone();
        }
        if self.url.starts_with("s3:") && self.url.contains("r2.cloudflarestorage.com") {
            return "r2-offsite".to_string();
        }
        if self.url.starts_with("s3:") {
            return "s3-remote".to_string();
        }
        self.name.clone()
    }

    /// Where the repository lives, used in the `repository_location` label
    pub fn location(&self) -> String {
        if let Some(location) = &self.location {
            return location.clone();
        }
        match self.kind {
            RepositoryKind::Local => {
                let path = std::path::Path::new(&self.url);
                path.parent()
                    .and_then(|p| p.file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "local".to_string())
            }
            RepositoryKind::Sftp | RepositoryKind::Rest => host_of(&self.url)
                .unwrap_or_else(|| "remote".to_string()),
            RepositoryKind::S3 | RepositoryKind::B2 | RepositoryKind::Rclone => {
                "offsite".to_string()
            }
        }
    }
}

fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once(':').map(|(_, rest)| rest)?;
    let rest = rest.split_once("://").map(|(_, r)| r).unwrap_or(rest);
    let rest = rest.rsplit_once('@').map(|(_, host)| host).unwrap_or(rest);
    let host = rest.split([':', '/']).next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// Keep-N-per-period retention applied after successful backups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub daily: u32,
    pub weekly: u32,
    pub monthly: u32,
    pub yearly: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily: 7,
            weekly: 4,
            monthly: 6,
            yearly: 1,
        }
    }
}

impl RetentionPolicy {
    pub fn is_empty(&self) -> bool {
        self.daily == 0 && self.weekly == 0 && self.monthly == 0 && self.yearly == 0
    }

    /// `restic forget` arguments for this policy; zero counts are left out
    pub fn forget_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (flag, count) in [
            ("--keep-daily", self.daily),
            ("--keep-weekly", self.weekly),
            ("--keep-monthly", self.monthly),
            ("--keep-yearly", self.yearly),
        ] {
            if count > 0 {
                args.push(flag.to_string());
                args.push(count.to_string());
            }
        }
        args
    }
}

/// IO scheduling class handed to `ionice -c`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IoClass {
    #[default]
    Idle,
    BestEffort,
    /// Do not wrap the command in ionice at all
    None,
}

impl IoClass {
    pub fn ionice_class(&self) -> Option<&'static str> {
        match self {
            IoClass::Idle => Some("3"),
            IoClass::BestEffort => Some("2"),
            IoClass::None => None,
        }
    }
}

/// Resource limits applied to the backup tool process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    pub nice: i32,
    pub io_class: IoClass,
    /// Address space ceiling, e.g. `512M` or `2G`
    pub memory_max: Option<String>,
    /// Hard timeout for the whole job run
    pub timeout_secs: Option<u64>,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            nice: 19,
            io_class: IoClass::Idle,
            memory_max: None,
            timeout_secs: None,
        }
    }
}

impl Resources {
    pub fn memory_max_bytes(&self) -> Option<Result<u64, String>> {
        self.memory_max.as_deref().map(parse_size)
    }
}

/// Parses sizes like `1024`, `512K`, `256M`, `2G`, `1T` (binary multiples)
pub fn parse_size(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty size".to_string());
    }
    let (digits, multiplier) = match trimmed.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let multiplier: u64 = match c.to_ascii_uppercase() {
                'K' => 1 << 10,
                'M' => 1 << 20,
                'G' => 1 << 30,
                'T' => 1 << 40,
                other => return Err(format!("unknown size suffix '{other}' in '{input}'")),
            };
            (&trimmed[..trimmed.len() - 1], multiplier)
        }
        _ => (trimmed, 1),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid size '{input}'"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{input}' overflows"))
}

/// A configured remote replication target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationPolicy {
    pub target_host: String,
    pub target_dataset: String,
    #[serde(default)]
    pub send_options: String,
    #[serde(default)]
    pub recv_options: String,
    /// Pinned host key in OpenSSH format (`ssh-ed25519 AAAA...`)
    #[serde(default)]
    pub host_key: Option<String>,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

fn default_ssh_user() -> String {
    "zfs-replication".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

/// One recovery source tried by the preseed orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestoreMethod {
    ReplicaPull,
    LocalSnapshot,
    RemoteRepository,
}

impl RestoreMethod {
    pub fn all() -> Vec<RestoreMethod> {
        vec![
            RestoreMethod::ReplicaPull,
            RestoreMethod::LocalSnapshot,
            RestoreMethod::RemoteRepository,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreMethod::ReplicaPull => "replica-pull",
            RestoreMethod::LocalSnapshot => "local-snapshot",
            RestoreMethod::RemoteRepository => "remote-repository",
        }
    }
}

impl fmt::Display for RestoreMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RestoreMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "replica-pull" | "syncoid" => Ok(RestoreMethod::ReplicaPull),
            "local-snapshot" | "local" => Ok(RestoreMethod::LocalSnapshot),
            "remote-repository" | "restic" => Ok(RestoreMethod::RemoteRepository),
            other => Err(format!(
                "unknown restore method '{other}', expected replica-pull, local-snapshot or remote-repository"
            )),
        }
    }
}

/// Backup declaration a service contributes to the job registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceBackup {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub resources: Option<Resources>,
    #[serde(default)]
    pub use_snapshots: bool,
}

/// Disaster recovery declaration of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePreseed {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "RestoreMethod::all")]
    pub methods: Vec<RestoreMethod>,
    /// Repository to restore from when it differs from the backup job's
    #[serde(default)]
    pub repository: Option<String>,
}

fn default_true() -> bool {
    true
}

/// A service as seen by the engine: its volume plus its declarations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Dataset backing the service's data, e.g. `tank/services/sonarr`
    #[serde(default)]
    pub dataset: Option<String>,
    /// Where the service expects its data
    #[serde(default)]
    pub mountpoint: Option<PathBuf>,
    #[serde(default)]
    pub backup: Option<ServiceBackup>,
    #[serde(default)]
    pub preseed: Option<ServicePreseed>,
}

/// A manually declared backup job
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSpec {
    pub repository: Option<String>,
    pub paths: Vec<PathBuf>,
    pub tags: Vec<String>,
    pub exclude: Vec<String>,
    pub frequency: Option<String>,
    pub resources: Option<Resources>,
    pub use_snapshots: bool,
    pub volume: Option<String>,
}

/// Where a materialised job came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOrigin {
    Service(String),
    Manual,
}

impl fmt::Display for JobOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOrigin::Service(name) => write!(f, "service '{name}'"),
            JobOrigin::Manual => f.write_str("manual declaration"),
        }
    }
}

/// One schedulable unit of backup work, as materialised by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupJob {
    pub name: String,
    pub repository: String,
    pub paths: Vec<PathBuf>,
    pub tags: Vec<String>,
    pub exclude: Vec<String>,
    pub frequency: String,
    pub resources: Resources,
    pub use_snapshots: bool,
    pub volume: Option<String>,
    pub origin: JobOrigin,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(name: &str, url: &str, kind: RepositoryKind) -> Repository {
        Repository {
            name: name.to_string(),
            url: url.to_string(),
            password_file: PathBuf::from("/run/secrets/restic"),
            environment_file: None,
            kind,
            primary: false,
            display_name: None,
            location: None,
        }
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("512K").unwrap(), 512 * 1024);
        assert_eq!(parse_size("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("").is_err());
        assert!(parse_size("M").is_err());
    }

    #[test]
    fn test_retention_args_skip_zero() {
        let policy = RetentionPolicy {
            daily: 7,
            weekly: 0,
            monthly: 6,
            yearly: 0,
        };
        assert_eq!(
            policy.forget_args(),
            vec!["--keep-daily", "7", "--keep-monthly", "6"]
        );
        assert!(!policy.is_empty());
    }

    #[test]
    fn test_repository_labels() {
        let nas = repo("nas-primary", "/mnt/nas-backup/restic", RepositoryKind::Local);
        assert_eq!(nas.display_name(), "nas-primary");
        assert_eq!(nas.location(), "nas-backup");

        let r2 = repo(
            "offsite",
            "s3:https://abc.r2.cloudflarestorage.com/bucket",
            RepositoryKind::S3,
        );
        assert_eq!(r2.display_name(), "r2-offsite");
        assert_eq!(r2.location(), "offsite");

        let sftp = repo("nas", "sftp:restic@nas-1.lan:/srv/restic", RepositoryKind::Sftp);
        assert_eq!(sftp.location(), "nas-1.lan");
    }

    #[test]
    fn test_restore_method_parse() {
        assert_eq!(
            "replica-pull".parse::<RestoreMethod>().unwrap(),
            RestoreMethod::ReplicaPull
        );
        assert_eq!(
            "restic".parse::<RestoreMethod>().unwrap(),
            RestoreMethod::RemoteRepository
        );
        assert!("tape".parse::<RestoreMethod>().is_err());
        assert_eq!(RestoreMethod::LocalSnapshot.to_string(), "local-snapshot");
    }
}
