use log::{debug, warn};
use russh::keys::*;
use russh::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::SshError;

/// Connection parameters for one remote host
pub struct RemoteShell {
    pub host: String,
    pub user: String,
    private_key_path: Option<PathBuf>,
    host_key: Option<String>,
    port: Option<u16>,
    connect_timeout: Duration,
}

struct Client {
    host: String,
    expected: Option<ssh_key::PublicKey>,
}

impl client::Handler for Client {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        match &self.expected {
            Some(expected) => {
                let matches = expected.key_data() == server_public_key.key_data();
                if !matches {
                    warn!("Host key presented by {} does not match the pinned key", self.host);
                }
                Ok(matches)
            }
            None => {
                warn!("No host key pinned for {}, accepting the presented key", self.host);
                Ok(true)
            }
        }
    }
}

/// Output of a remote command
#[derive(Debug, Default, Clone)]
pub struct ExecOutput {
    pub exit_status: Option<u32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

impl RemoteShell {
    pub fn new(host: String, user: String, port: Option<u16>) -> Self {
        Self {
            host,
            user,
            private_key_path: None,
            host_key: None,
            port: Some(port.unwrap_or(22)),
            connect_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_private_key_path(mut self, private_key_path: PathBuf) -> Self {
        self.private_key_path = Some(private_key_path);
        self
    }

    /// Pins the server key, OpenSSH format (`ssh-ed25519 AAAA... comment`)
    pub fn with_host_key(mut self, host_key: String) -> Self {
        self.host_key = Some(host_key);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(22)
    }

    pub(crate) fn expected_host_key(&self) -> Result<Option<ssh_key::PublicKey>, SshError> {
        self.host_key
            .as_deref()
            .map(|key| {
                ssh_key::PublicKey::from_openssh(key.trim()).map_err(|e| {
                    SshError::ConfigurationError(format!("invalid pinned host key: {e}"))
                })
            })
            .transpose()
    }

    /// Opens an authenticated session
    pub async fn connect(&self) -> Result<RemoteSession, SshError> {
        let key_path = self.private_key_path.as_ref().ok_or_else(|| {
            SshError::ConfigurationError(format!("no SSH key configured for {}", self.host))
        })?;
        let key_pair = load_secret_key(key_path, None).map_err(|e| {
            SshError::ConfigurationError(format!(
                "failed to load SSH key {}: {e}",
                key_path.display()
            ))
        })?;

        let handler = Client {
            host: self.host.clone(),
            expected: self.expected_host_key()?,
        };
        let config = Arc::new(client::Config::default());

        debug!("Connecting to {}@{}:{}", self.user, self.host, self.port());
        let mut session = tokio::time::timeout(
            self.connect_timeout,
            client::connect(config, (self.host.as_str(), self.port()), handler),
        )
        .await
        .map_err(|_| {
            SshError::ConnectionError(format!(
                "timed out connecting to {}:{}",
                self.host,
                self.port()
            ))
        })?
        .map_err(|e| match e {
            russh::Error::UnknownKey => SshError::HostKeyMismatch(self.host.clone()),
            other => SshError::ConnectionError(other.to_string()),
        })?;

        let auth_res = session
            .authenticate_publickey(
                &self.user,
                PrivateKeyWithHashAlg::new(
                    Arc::new(key_pair),
                    session.best_supported_rsa_hash().await?.flatten(),
                ),
            )
            .await?;

        if !auth_res.success() {
            return Err(SshError::AuthenticationError(format!(
                "public key rejected for {}@{}",
                self.user, self.host
            )));
        }

        Ok(RemoteSession {
            host: self.host.clone(),
            handle: session,
        })
    }
}

/// An authenticated connection to a remote host
pub struct RemoteSession {
    host: String,
    handle: client::Handle<Client>,
}

impl RemoteSession {
    /// Runs `command` and collects its output
    pub async fn exec(&self, command: &str) -> Result<ExecOutput, SshError> {
        debug!("Running on {}: {command}", self.host);
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut output = ExecOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    output.stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => output.exit_status = Some(exit_status),
                _ => {}
            }
        }
        Ok(output)
    }

    /// Like [`exec`](Self::exec) but fails unless the command exits 0
    pub async fn exec_checked(&self, command: &str) -> Result<ExecOutput, SshError> {
        let output = self.exec(command).await?;
        if !output.success() {
            return Err(SshError::CommandFailed {
                command: command.to_string(),
                status: output.exit_status,
                stderr: output.stderr_lossy().trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Runs `command`, copying its stdout into `sink` as it arrives.
    /// Returns the number of bytes copied.
    pub async fn stream_to<W>(&self, command: &str, sink: &mut W) -> Result<u64, SshError>
    where
        W: AsyncWrite + Unpin,
    {
        debug!("Streaming from {}: {command}", self.host);
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut copied = 0u64;
        let mut exit_status = None;
        let mut stderr = Vec::new();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => {
                    sink.write_all(data).await?;
                    copied += data.len() as u64;
                }
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                _ => {}
            }
        }
        sink.flush().await?;

        if exit_status != Some(0) {
            return Err(SshError::CommandFailed {
                command: command.to_string(),
                status: exit_status,
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        Ok(copied)
    }

    pub async fn close(self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!("Error closing SSH session to {}: {e}", self.host);
        }
    }
}
