use thiserror::Error;

mod ssh;

pub use ssh::{ExecOutput, RemoteSession, RemoteShell};

#[derive(Error, Debug)]
pub enum SshError {
    #[error("SSH configuration error: {0}")]
    ConfigurationError(String),
    #[error("SSH connection error: {0}")]
    ConnectionError(String),
    #[error("SSH authentication error: {0}")]
    AuthenticationError(String),
    #[error("SSH host key for {0} does not match the pinned key")]
    HostKeyMismatch(String),
    #[error("Remote command `{command}` failed with status {status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<u32>,
        stderr: String,
    },
    #[error("SSH channel error: {0}")]
    ChannelError(String),
}

impl From<std::io::Error> for SshError {
    fn from(err: std::io::Error) -> Self {
        SshError::ConnectionError(err.to_string())
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ChannelError(err.to_string())
    }
}

/// Quotes `arg` for a POSIX remote shell
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.' | '@' | ':' | '%' | '='))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new() {
        let shell = RemoteShell::new("nas-1".to_string(), "zfs-replication".to_string(), None);
        assert_eq!(shell.host, "nas-1");
        assert_eq!(shell.user, "zfs-replication");
        assert_eq!(shell.port(), 22);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("backup/forge/zfs-recv@autosnap_2024"), "backup/forge/zfs-recv@autosnap_2024");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_invalid_pinned_key_is_a_configuration_error() {
        let shell = RemoteShell::new("nas-1".to_string(), "root".to_string(), Some(22))
            .with_host_key("not a key".to_string());
        assert!(matches!(
            shell.expected_host_key(),
            Err(SshError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_without_key_path_fails() {
        let shell = RemoteShell::new("127.0.0.1".to_string(), "root".to_string(), Some(1))
            .with_connect_timeout(Duration::from_millis(200));
        assert!(matches!(
            shell.connect().await,
            Err(SshError::ConfigurationError(_))
        ));
    }
}
