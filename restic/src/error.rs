use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// How a failed restic invocation should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Something the run depends on is missing; try another source
    PreconditionFailed,
    /// Lock contention or network trouble; worth retrying
    Transient,
    /// Corruption, bad credentials and everything unrecognised
    Hard,
}

#[derive(Error, Debug)]
pub enum ResticError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("restic {command} failed with exit status {status:?}: {message}")]
    Command {
        command: String,
        status: Option<i32>,
        kind: FailureKind,
        message: String,
    },

    #[error("Backup reported {errors} unreadable files, more than the allowed {limit}")]
    TooManyErrors { errors: u64, limit: u64 },

    #[error("Repository '{0}' is not configured")]
    UnknownRepository(String),

    #[error("Password file {0} does not exist")]
    MissingPasswordFile(PathBuf),

    #[error("Job {0} is already running")]
    AlreadyRunning(String),

    #[error("Refusing to prune repository '{0}' without a tag filter")]
    UntaggedForget(String),

    #[error("Run cancelled: {0}")]
    Cancelled(String),

    #[error("Job {job} did not finish within {secs} seconds")]
    Timeout { job: String, secs: u64 },

    #[error("Invalid resource limit: {0}")]
    Resources(String),

    #[error("Unexpected restic output: {0}")]
    Output(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Snapshot error: {0}")]
    Zfs(#[from] zfs::ZfsError),

    #[error("Status record error: {0}")]
    Metrics(#[from] metrics::MetricsError),
}

impl ResticError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ResticError::Command { kind, .. } => *kind,
            ResticError::Spawn { .. }
            | ResticError::UnknownRepository(_)
            | ResticError::MissingPasswordFile(_) => FailureKind::PreconditionFailed,
            _ => FailureKind::Hard,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == FailureKind::Transient
    }
}

const HARD_MESSAGES: &[&str] = &[
    "wrong password",
    "no key found",
    "ciphertext verification failed",
    "is damaged",
    "contains errors",
    "invalid data returned",
    "permission denied",
];

const TRANSIENT_MESSAGES: &[&str] = &[
    "unable to create lock",
    "repository is already locked",
    "connection refused",
    "connection reset",
    "connection timed out",
    "i/o timeout",
    "timeout awaiting",
    "tls handshake timeout",
    "temporary failure",
    "no such host",
    "network is unreachable",
    "too many requests",
    "service unavailable",
    "bad gateway",
    "gateway timeout",
    "unexpected eof",
];

fn mentions(stderr: &str, messages: &[&str]) -> bool {
    let lower = stderr.to_lowercase();
    messages.iter().any(|m| lower.contains(m))
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::PreconditionFailed => "precondition",
            FailureKind::Transient => "transient",
            FailureKind::Hard => "hard",
        }
    }
}

/// Exit code restic uses when the repository does not exist
pub const EXIT_REPO_MISSING: i32 = 10;
/// Exit code for "some source files could not be read"
pub const EXIT_PARTIAL: i32 = 3;

/// Classifies a non-zero restic exit from its status and stderr
pub fn classify(status: Option<i32>, stderr: &str) -> FailureKind {
    match status {
        Some(11) => FailureKind::Transient,
        Some(12) => FailureKind::Hard,
        Some(EXIT_REPO_MISSING) => FailureKind::PreconditionFailed,
        _ if mentions(stderr, HARD_MESSAGES) => FailureKind::Hard,
        _ if mentions(stderr, TRANSIENT_MESSAGES) => FailureKind::Transient,
        _ if is_missing_repository(stderr) => FailureKind::PreconditionFailed,
        _ => FailureKind::Hard,
    }
}

/// restic's message for a repository that was never initialised
pub fn is_missing_repository(stderr: &str) -> bool {
    stderr.contains("Is there a repository at the following location?")
        || stderr.contains("repository does not exist")
        || (stderr.contains("unable to open config file") && stderr.contains("no such file"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_exit_code() {
        assert_eq!(classify(Some(11), ""), FailureKind::Transient);
        assert_eq!(classify(Some(12), ""), FailureKind::Hard);
        assert_eq!(classify(Some(10), ""), FailureKind::PreconditionFailed);
    }

    #[test]
    fn test_classify_by_message() {
        assert_eq!(
            classify(Some(1), "Fatal: unable to create lock in backend: repository is already locked by PID 123"),
            FailureKind::Transient
        );
        assert_eq!(
            classify(Some(1), "Fatal: wrong password or no key found"),
            FailureKind::Hard
        );
        assert_eq!(
            classify(Some(1), "Get \"https://s3.example\": dial tcp: connection refused"),
            FailureKind::Transient
        );
        assert_eq!(
            classify(
                Some(1),
                "Fatal: unable to open config file: stat /mnt/nas/restic/config: no such file or directory\nIs there a repository at the following location?"
            ),
            FailureKind::PreconditionFailed
        );
        assert_eq!(classify(Some(1), "something odd"), FailureKind::Hard);
    }

    #[test]
    fn test_error_kinds() {
        assert!(ResticError::Command {
            command: "backup".into(),
            status: Some(11),
            kind: FailureKind::Transient,
            message: String::new(),
        }
        .is_transient());
        assert_eq!(
            ResticError::MissingPasswordFile(PathBuf::from("/x")).kind(),
            FailureKind::PreconditionFailed
        );
        assert_eq!(
            ResticError::TooManyErrors { errors: 60, limit: 50 }.kind(),
            FailureKind::Hard
        );
    }
}
