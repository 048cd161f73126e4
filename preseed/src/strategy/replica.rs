use async_trait::async_trait;
use log::{debug, info};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use common::{resolve, ReplicationPolicy, RestoreMethod};
use ssh::{shell_quote, RemoteShell};

use super::{RestoreStrategy, StrategyError};
use crate::PreseedTarget;

/// The host a dataset is replicated to
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReplicaSource: Send + Sync {
    /// Newest snapshot of `policy.target_dataset` on the replica
    async fn latest_snapshot(&self, policy: &ReplicationPolicy) -> Result<Option<String>, StrategyError>;

    /// Streams `snapshot` from the replica into the local `dataset`.
    /// Returns the number of bytes received.
    async fn pull(&self, policy: &ReplicationPolicy, snapshot: &str, dataset: &str) -> Result<u64, StrategyError>;
}

/// Replica reached over SSH, received with `zfs receive`
pub struct SshReplica {
    zfs_binary: String,
    connect_timeout: Duration,
}

impl SshReplica {
    pub fn new(zfs_binary: impl Into<String>) -> Self {
        Self {
            zfs_binary: zfs_binary.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    fn shell(&self, policy: &ReplicationPolicy) -> RemoteShell {
        let mut shell = RemoteShell::new(
            policy.target_host.clone(),
            policy.ssh_user.clone(),
            Some(policy.ssh_port),
        )
        .with_connect_timeout(self.connect_timeout);
        if let Some(key) = &policy.ssh_key {
            shell = shell.with_private_key_path(key.clone());
        }
        if let Some(host_key) = &policy.host_key {
            shell = shell.with_host_key(host_key.clone());
        }
        shell
    }
}

fn send_command(policy: &ReplicationPolicy, snapshot: &str) -> String {
    let flags = policy.send_options.trim().trim_start_matches('-');
    if flags.is_empty() {
        format!("zfs send {}", shell_quote(snapshot))
    } else {
        format!("zfs send -{flags} {}", shell_quote(snapshot))
    }
}

/// `zfs receive` arguments for `dataset`. `recv_options` takes the form of
/// `send_options`: bare flags (`u`, `-s`) plus `o prop=value` and `x prop`
/// pairs, separated by whitespace.
fn receive_args(policy: &ReplicationPolicy, dataset: &str) -> Vec<String> {
    let mut args = vec!["receive".to_string(), "-F".to_string()];
    let mut tokens = policy.recv_options.split_whitespace();
    while let Some(token) = tokens.next() {
        let flag = token.trim_start_matches('-');
        match flag {
            "" | "F" => {}
            "o" | "x" => {
                if let Some(value) = tokens.next() {
                    args.push(format!("-{flag}"));
                    args.push(value.to_string());
                }
            }
            _ => args.push(format!("-{flag}")),
        }
    }
    args.push(dataset.to_string());
    args
}

#[async_trait]
impl ReplicaSource for SshReplica {
    async fn latest_snapshot(&self, policy: &ReplicationPolicy) -> Result<Option<String>, StrategyError> {
        let session = self.shell(policy).connect().await?;
        let command = format!(
            "zfs list -H -t snapshot -o name -s creation -d 1 {}",
            shell_quote(&policy.target_dataset)
        );
        let output = session.exec(&command).await;
        session.close().await;
        let output = output?;
        if !output.success() {
            debug!(
                "Listing snapshots on {} failed: {}",
                policy.target_host,
                output.stderr_lossy().trim()
            );
            return Ok(None);
        }
        Ok(output
            .stdout_lossy()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .map(String::from))
    }

    async fn pull(&self, policy: &ReplicationPolicy, snapshot: &str, dataset: &str) -> Result<u64, StrategyError> {
        let session = self.shell(policy).connect().await?;

        let mut receive = Command::new(&self.zfs_binary)
            .args(receive_args(policy, dataset))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let mut stdin = receive
            .stdin
            .take()
            .ok_or_else(|| StrategyError::Failed("zfs receive has no stdin".to_string()))?;

        let streamed = session.stream_to(&send_command(policy, snapshot), &mut stdin).await;
        drop(stdin);
        session.close().await;

        let output = receive.wait_with_output().await?;
        let bytes = streamed?;
        if !output.status.success() {
            return Err(StrategyError::Failed(format!(
                "zfs receive {dataset} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(bytes)
    }
}

/// Pulls the dataset back from the host it is replicated to
pub struct ReplicaPull {
    policies: BTreeMap<String, ReplicationPolicy>,
    source: Arc<dyn ReplicaSource>,
}

impl ReplicaPull {
    pub fn new(policies: BTreeMap<String, ReplicationPolicy>, source: Arc<dyn ReplicaSource>) -> Self {
        Self { policies, source }
    }

    fn policy<'a>(&self, target: &'a PreseedTarget) -> Result<(&'a str, ReplicationPolicy), StrategyError> {
        let dataset = target
            .dataset
            .as_deref()
            .ok_or_else(|| StrategyError::unavailable("service has no dataset"))?;
        let resolved = resolve(&self.policies, dataset).ok_or_else(|| {
            StrategyError::unavailable(format!("no replication policy covers {dataset}"))
        })?;
        Ok((dataset, resolved.policy))
    }

    async fn latest(&self, policy: &ReplicationPolicy) -> Result<String, StrategyError> {
        match self.source.latest_snapshot(policy).await {
            Ok(Some(snapshot)) => Ok(snapshot),
            Ok(None) => Err(StrategyError::unavailable(format!(
                "{} has no snapshot of {}",
                policy.target_host, policy.target_dataset
            ))),
            Err(StrategyError::Unavailable(reason)) => Err(StrategyError::Unavailable(reason)),
            Err(e) => Err(StrategyError::unavailable(format!(
                "replica {} unreachable: {e}",
                policy.target_host
            ))),
        }
    }
}

#[async_trait]
impl RestoreStrategy for ReplicaPull {
    fn method(&self) -> RestoreMethod {
        RestoreMethod::ReplicaPull
    }

    async fn precondition(&self, target: &PreseedTarget) -> Result<(), StrategyError> {
        let (_, policy) = self.policy(target)?;
        self.latest(&policy).await.map(|_| ())
    }

    async fn execute(&self, target: &PreseedTarget) -> Result<String, StrategyError> {
        let (dataset, policy) = self.policy(target)?;
        let snapshot = self.latest(&policy).await?;
        info!(
            "Receiving {snapshot} from {} into {dataset}",
            policy.target_host
        );
        let bytes = self.source.pull(&policy, &snapshot, dataset).await?;
        Ok(format!(
            "received {snapshot} from {} ({bytes} bytes)",
            policy.target_host
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::target;

    fn policies() -> BTreeMap<String, ReplicationPolicy> {
        let mut policies = BTreeMap::new();
        policies.insert(
            "tank/services".to_string(),
            ReplicationPolicy {
                target_host: "nas-1".to_string(),
                target_dataset: "backup/forge/zfs-recv".to_string(),
                send_options: "w".to_string(),
                recv_options: "u".to_string(),
                host_key: Some("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIDummy".to_string()),
                ssh_user: "zfs-replication".to_string(),
                ssh_key: None,
                ssh_port: 22,
            },
        );
        policies
    }

    #[tokio::test]
    async fn test_pulls_inherited_target() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = MockReplicaSource::new();
        source
            .expect_latest_snapshot()
            .withf(|p| p.target_dataset == "backup/forge/zfs-recv/sonarr")
            .returning(|_| Ok(Some("backup/forge/zfs-recv/sonarr@autosnap_2026-10-18".to_string())));
        source
            .expect_pull()
            .withf(|_, snapshot, dataset| {
                snapshot == "backup/forge/zfs-recv/sonarr@autosnap_2026-10-18"
                    && dataset == "tank/services/sonarr"
            })
            .times(1)
            .returning(|_, _, _| Ok(4096));

        let strategy = ReplicaPull::new(policies(), Arc::new(source));
        let target = target(dir.path());
        strategy.precondition(&target).await.unwrap();
        let detail = strategy.execute(&target).await.unwrap();
        assert!(detail.contains("nas-1"));
        assert!(detail.contains("4096 bytes"));
    }

    #[tokio::test]
    async fn test_unreachable_replica_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = MockReplicaSource::new();
        source.expect_latest_snapshot().returning(|_| {
            Err(StrategyError::Ssh(ssh::SshError::ConnectionError(
                "connection refused".to_string(),
            )))
        });
        source.expect_pull().never();

        let strategy = ReplicaPull::new(policies(), Arc::new(source));
        let err = strategy.precondition(&target(dir.path())).await.unwrap_err();
        assert!(matches!(err, StrategyError::Unavailable(reason) if reason.contains("unreachable")));
    }

    #[tokio::test]
    async fn test_dataset_without_policy_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = MockReplicaSource::new();
        source.expect_latest_snapshot().never();

        let strategy = ReplicaPull::new(BTreeMap::new(), Arc::new(source));
        let err = strategy.precondition(&target(dir.path())).await.unwrap_err();
        assert!(err.to_string().contains("no replication policy"));
    }

    #[test]
    fn test_send_command() {
        let policies = policies();
        let policy = &policies["tank/services"];
        assert_eq!(
            send_command(policy, "backup/forge/zfs-recv/sonarr@snap"),
            "zfs send -w backup/forge/zfs-recv/sonarr@snap"
        );
    }

    #[test]
    fn test_receive_args_carry_recv_options() {
        let mut policy = policies()["tank/services"].clone();
        assert_eq!(
            receive_args(&policy, "tank/services/sonarr"),
            vec!["receive", "-F", "-u", "tank/services/sonarr"]
        );

        policy.recv_options = "-s o canmount=noauto x encryption F".to_string();
        assert_eq!(
            receive_args(&policy, "tank/services/sonarr"),
            vec![
                "receive", "-F", "-s", "-o", "canmount=noauto", "-x", "encryption",
                "tank/services/sonarr"
            ]
        );

        policy.recv_options = String::new();
        assert_eq!(
            receive_args(&policy, "tank/services/sonarr"),
            vec!["receive", "-F", "tank/services/sonarr"]
        );
    }
}
