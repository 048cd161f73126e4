use log::{error, info, warn};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{CustodianConfig, RestoreMethod};
use metrics::{Labels, StatusRecord, StatusWriter};
use restic::SystemRunner;
use zfs::Zfs;

use crate::strategy::{LocalSnapshot, RemoteRepository, ReplicaPull, RestoreStrategy, SshReplica, StrategyError};
use crate::{PreseedError, PreseedTarget};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Precondition not met, nothing was touched
    Skipped(String),
    Failed(String),
    Succeeded(String),
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Skipped(reason) => write!(f, "skipped: {reason}"),
            AttemptOutcome::Failed(reason) => write!(f, "failed: {reason}"),
            AttemptOutcome::Succeeded(detail) => write!(f, "succeeded: {detail}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreAttempt {
    pub method: RestoreMethod,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreseedOutcome {
    /// The volume already holds data; no strategy was consulted
    AlreadyPopulated,
    Restored {
        method: RestoreMethod,
        attempts: Vec<RestoreAttempt>,
    },
}

/// Whether `path` is missing or holds nothing but `lost+found`
pub fn volume_is_empty(path: &Path) -> std::io::Result<bool> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e),
    };
    for entry in entries {
        if entry?.file_name() != "lost+found" {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Removes everything in `path` except `lost+found`
pub fn clear_volume(path: &Path) -> std::io::Result<()> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_name() == "lost+found" {
            continue;
        }
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Tries restore strategies in order until one seeds the volume.
///
/// A marker in the state directory exists while a strategy is writing to the
/// volume, and a failed strategy's leftovers are cleared before the next one
/// runs. A run that finds the marker treats the volume's contents as a
/// partial restore and clears them instead of reporting the volume as
/// populated.
pub struct Orchestrator {
    strategies: Vec<Box<dyn RestoreStrategy>>,
    status: StatusWriter,
    state_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(strategies: Vec<Box<dyn RestoreStrategy>>, status: StatusWriter, state_dir: PathBuf) -> Self {
        Self {
            strategies,
            status,
            state_dir,
        }
    }

    /// Strategies for `methods`, in that order
    pub fn from_config(config: &CustodianConfig, methods: &[RestoreMethod]) -> Self {
        let runner = Arc::new(SystemRunner::new(
            config.binaries.nice.clone(),
            config.binaries.ionice.clone(),
        ));
        let zfs = Arc::new(Zfs::new(config.binaries.zfs.clone()));

        let strategies = methods
            .iter()
            .map(|method| -> Box<dyn RestoreStrategy> {
                match method {
                    RestoreMethod::ReplicaPull => Box::new(ReplicaPull::new(
                        config.replication.clone(),
                        Arc::new(SshReplica::new(config.binaries.zfs.clone())),
                    )),
                    RestoreMethod::LocalSnapshot => Box::new(LocalSnapshot::new(zfs.clone())),
                    RestoreMethod::RemoteRepository => {
                        Box::new(RemoteRepository::new(config.clone(), runner.clone()))
                    }
                }
            })
            .collect();
        Self::new(
            strategies,
            StatusWriter::new(config.status_dir.clone()),
            config.state_dir.join("preseed"),
        )
    }

    pub fn status_name(service: &str) -> String {
        format!("preseed_{service}")
    }

    fn pending_marker(&self, service: &str) -> PathBuf {
        self.state_dir.join(format!("{service}.pending"))
    }

    pub async fn run(&self, target: &PreseedTarget) -> Result<PreseedOutcome, PreseedError> {
        let marker = self.pending_marker(&target.service);
        if marker.exists() {
            warn!(
                "A previous preseed of {} did not finish, clearing {}",
                target.service,
                target.mountpoint.display()
            );
            clear_volume(&target.mountpoint)?;
            fs::remove_file(&marker)?;
        } else if !volume_is_empty(&target.mountpoint)? {
            info!(
                "{} already holds data, nothing to restore for {}",
                target.mountpoint.display(),
                target.service
            );
            return Ok(PreseedOutcome::AlreadyPopulated);
        }

        info!(
            "Volume of {} is empty, trying {} restore method(s)",
            target.service,
            self.strategies.len()
        );
        let mut attempts = Vec::new();
        for strategy in &self.strategies {
            let method = strategy.method();
            if let Err(e) = strategy.precondition(target).await {
                info!("Skipping {}: {e}", method.as_str());
                attempts.push(RestoreAttempt {
                    method,
                    outcome: AttemptOutcome::Skipped(e.to_string()),
                });
                continue;
            }

            info!("Restoring {} with {}", target.service, method.as_str());
            fs::create_dir_all(&self.state_dir)?;
            fs::write(&marker, target.mountpoint.to_string_lossy().as_bytes())?;
            match strategy.execute(target).await {
                Ok(detail) => {
                    fs::remove_file(&marker)?;
                    info!("{} restored: {detail}", target.service);
                    attempts.push(RestoreAttempt {
                        method,
                        outcome: AttemptOutcome::Succeeded(detail),
                    });
                    self.write_status(target, Some(method), attempts.len());
                    return Ok(PreseedOutcome::Restored { method, attempts });
                }
                Err(e) => {
                    warn!("{} failed for {}: {e}", method.as_str(), target.service);
                    attempts.push(RestoreAttempt {
                        method,
                        outcome: AttemptOutcome::Failed(e.to_string()),
                    });
                    clear_volume(&target.mountpoint)?;
                    fs::remove_file(&marker)?;
                }
            }
        }

        error!("No restore method could seed {}", target.service);
        self.write_status(target, None, attempts.len());
        Err(PreseedError::Exhausted(attempts))
    }

    fn write_status(&self, target: &PreseedTarget, method: Option<RestoreMethod>, attempts: usize) {
        let labels = Labels::new()
            .with("service", target.service.as_str())
            .with("method", method.map(|m| m.as_str()).unwrap_or("none"));
        let mut record = StatusRecord::new();
        record
            .gauge(
                "custodian_preseed_status",
                "Whether the last preseed seeded the volume (1 = restored, 0 = exhausted)",
                &labels,
                if method.is_some() { 1.0 } else { 0.0 },
            )
            .gauge(
                "custodian_preseed_last_run_timestamp",
                "Time of the last preseed",
                &labels,
                metrics::unix_now(),
            )
            .gauge(
                "custodian_preseed_attempts",
                "Restore methods consulted by the last preseed",
                &labels,
                attempts as f64,
            );
        if let Err(e) = self.status.write(&Self::status_name(&target.service), &record) {
            error!("Failed to write preseed status for {}: {e}", target.service);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::MockRestoreStrategy;
    use crate::test_support::target;
    use std::time::Duration;
    use tempfile::TempDir;

    fn unavailable(method: RestoreMethod) -> Box<dyn RestoreStrategy> {
        let mut mock = MockRestoreStrategy::new();
        mock.expect_method().return_const(method);
        mock.expect_precondition()
            .returning(|_| Err(StrategyError::unavailable("not reachable")));
        mock.expect_execute().never();
        Box::new(mock)
    }

    fn working(method: RestoreMethod, result: Result<&'static str, &'static str>) -> Box<dyn RestoreStrategy> {
        let mut mock = MockRestoreStrategy::new();
        mock.expect_method().return_const(method);
        mock.expect_precondition().times(1).returning(|_| Ok(()));
        mock.expect_execute().times(1).returning(move |_| match result {
            Ok(detail) => Ok(detail.to_string()),
            Err(reason) => Err(StrategyError::Failed(reason.to_string())),
        });
        Box::new(mock)
    }

    fn untouched(method: RestoreMethod) -> Box<dyn RestoreStrategy> {
        let mut mock = MockRestoreStrategy::new();
        mock.expect_method().return_const(method);
        mock.expect_precondition().never();
        mock.expect_execute().never();
        Box::new(mock)
    }

    /// Writes part of a restore into the volume, then fails
    fn half_written(method: RestoreMethod) -> Box<dyn RestoreStrategy> {
        let mut mock = MockRestoreStrategy::new();
        mock.expect_method().return_const(method);
        mock.expect_precondition().returning(|_| Ok(()));
        mock.expect_execute().times(1).returning(|target| {
            fs::create_dir_all(target.mountpoint.join("db")).unwrap();
            fs::write(target.mountpoint.join("db/half.db"), "partial").unwrap();
            Err(StrategyError::Failed("connection reset by peer".to_string()))
        });
        Box::new(mock)
    }

    /// Succeeds only when it finds the volume empty
    fn on_clean_volume(method: RestoreMethod) -> Box<dyn RestoreStrategy> {
        let mut mock = MockRestoreStrategy::new();
        mock.expect_method().return_const(method);
        mock.expect_precondition().times(1).returning(|_| Ok(()));
        mock.expect_execute().times(1).returning(|target| {
            if volume_is_empty(&target.mountpoint).unwrap() {
                fs::create_dir_all(&target.mountpoint).unwrap();
                fs::write(target.mountpoint.join("config.xml"), "<Config/>").unwrap();
                Ok("restored".to_string())
            } else {
                Err(StrategyError::Failed("volume is dirty".to_string()))
            }
        });
        Box::new(mock)
    }

    fn orchestrator(dir: &TempDir, strategies: Vec<Box<dyn RestoreStrategy>>) -> Orchestrator {
        Orchestrator::new(
            strategies,
            StatusWriter::new(dir.path().join("status")),
            dir.path().join("state"),
        )
    }

    fn pending(dir: &TempDir) -> bool {
        dir.path().join("state/sonarr.pending").exists()
    }

    fn status(dir: &TempDir) -> Vec<metrics::Sample> {
        StatusWriter::new(dir.path().join("status"))
            .read("preseed_sonarr")
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_only_attemptable_strategy_runs() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(
            &dir,
            vec![
                unavailable(RestoreMethod::ReplicaPull),
                unavailable(RestoreMethod::LocalSnapshot),
                working(RestoreMethod::RemoteRepository, Ok("restored snapshot c0ffee00")),
            ],
        );

        let outcome = orchestrator.run(&target(&dir.path().join("sonarr"))).await.unwrap();
        let PreseedOutcome::Restored { method, attempts } = outcome else {
            panic!("expected a restore");
        };
        assert_eq!(method, RestoreMethod::RemoteRepository);
        assert_eq!(attempts.len(), 3);
        assert!(matches!(attempts[0].outcome, AttemptOutcome::Skipped(_)));
        assert!(matches!(attempts[1].outcome, AttemptOutcome::Skipped(_)));

        let samples = status(&dir);
        assert_eq!(samples[0].value, 1.0);
        assert_eq!(samples[0].labels.get("method"), Some("remote-repository"));
    }

    #[tokio::test]
    async fn test_first_success_stops_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(
            &dir,
            vec![
                working(RestoreMethod::ReplicaPull, Ok("received")),
                untouched(RestoreMethod::LocalSnapshot),
            ],
        );
        let outcome = orchestrator.run(&target(&dir.path().join("sonarr"))).await.unwrap();
        assert!(matches!(
            outcome,
            PreseedOutcome::Restored {
                method: RestoreMethod::ReplicaPull,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_execution_failure_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(
            &dir,
            vec![
                working(RestoreMethod::ReplicaPull, Err("zfs receive failed")),
                working(RestoreMethod::LocalSnapshot, Ok("rolled back")),
            ],
        );
        let PreseedOutcome::Restored { method, attempts } =
            orchestrator.run(&target(&dir.path().join("sonarr"))).await.unwrap()
        else {
            panic!("expected a restore");
        };
        assert_eq!(method, RestoreMethod::LocalSnapshot);
        assert_eq!(
            attempts[0].outcome,
            AttemptOutcome::Failed("zfs receive failed".to_string())
        );
    }

    #[tokio::test]
    async fn test_exhaustion_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(
            &dir,
            vec![
                unavailable(RestoreMethod::ReplicaPull),
                working(RestoreMethod::RemoteRepository, Err("restore failed")),
            ],
        );
        let err = orchestrator
            .run(&target(&dir.path().join("sonarr")))
            .await
            .unwrap_err();
        let PreseedError::Exhausted(attempts) = &err else {
            panic!("expected exhaustion, got {err}");
        };
        assert_eq!(attempts.len(), 2);
        assert!(err.to_string().contains("replica-pull (skipped: not reachable)"));
        assert_eq!(status(&dir)[0].value, 0.0);
    }

    #[tokio::test]
    async fn test_failed_method_leaves_a_clean_volume_for_the_next() {
        let dir = tempfile::tempdir().unwrap();
        let volume = dir.path().join("sonarr");
        let orchestrator = orchestrator(
            &dir,
            vec![
                half_written(RestoreMethod::ReplicaPull),
                on_clean_volume(RestoreMethod::RemoteRepository),
            ],
        );
        let PreseedOutcome::Restored { method, .. } = orchestrator.run(&target(&volume)).await.unwrap() else {
            panic!("expected a restore");
        };
        assert_eq!(method, RestoreMethod::RemoteRepository);
        assert!(volume.join("config.xml").exists());
        assert!(!volume.join("db").exists());
        assert!(!pending(&dir));
    }

    /// Writes part of a restore, then never finishes
    struct Stalled;

    #[async_trait::async_trait]
    impl RestoreStrategy for Stalled {
        fn method(&self) -> RestoreMethod {
            RestoreMethod::RemoteRepository
        }

        async fn precondition(&self, _target: &PreseedTarget) -> Result<(), StrategyError> {
            Ok(())
        }

        async fn execute(&self, target: &PreseedTarget) -> Result<String, StrategyError> {
            fs::create_dir_all(target.mountpoint.join("db"))?;
            fs::write(target.mountpoint.join("db/half.db"), "partial")?;
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_failed_run_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let volume = dir.path().join("sonarr");

        let first = orchestrator(&dir, vec![half_written(RestoreMethod::RemoteRepository)]);
        assert!(matches!(
            first.run(&target(&volume)).await,
            Err(PreseedError::Exhausted(_))
        ));
        assert!(volume_is_empty(&volume).unwrap());
        assert!(!pending(&dir));

        let second = orchestrator(&dir, vec![on_clean_volume(RestoreMethod::RemoteRepository)]);
        assert!(matches!(
            second.run(&target(&volume)).await.unwrap(),
            PreseedOutcome::Restored { .. }
        ));
    }

    #[tokio::test]
    async fn test_interrupted_preseed_is_retried_not_reported_populated() {
        let dir = tempfile::tempdir().unwrap();
        let volume = dir.path().join("sonarr");
        fs::create_dir_all(volume.join("lost+found")).unwrap();

        let first = orchestrator(&dir, vec![Box::new(Stalled) as Box<dyn RestoreStrategy>]);
        let interrupted =
            tokio::time::timeout(Duration::from_millis(200), first.run(&target(&volume))).await;
        assert!(interrupted.is_err());
        assert!(volume.join("db/half.db").exists());
        assert!(pending(&dir));

        let second = orchestrator(&dir, vec![on_clean_volume(RestoreMethod::RemoteRepository)]);
        let outcome = second.run(&target(&volume)).await.unwrap();
        assert!(matches!(
            outcome,
            PreseedOutcome::Restored {
                method: RestoreMethod::RemoteRepository,
                ..
            }
        ));
        assert!(!volume.join("db").exists());
        assert!(volume.join("lost+found").exists());
        assert!(!pending(&dir));
        assert_eq!(status(&dir)[0].value, 1.0);

        let third = orchestrator(&dir, vec![untouched(RestoreMethod::RemoteRepository)]);
        assert_eq!(
            third.run(&target(&volume)).await.unwrap(),
            PreseedOutcome::AlreadyPopulated
        );
    }

    #[tokio::test]
    async fn test_populated_volume_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let volume = dir.path().join("sonarr");
        fs::create_dir_all(&volume).unwrap();
        fs::write(volume.join("config.xml"), "<Config/>").unwrap();

        let orchestrator = orchestrator(
            &dir,
            vec![
                untouched(RestoreMethod::ReplicaPull),
                untouched(RestoreMethod::LocalSnapshot),
                untouched(RestoreMethod::RemoteRepository),
            ],
        );
        let outcome = orchestrator.run(&target(&volume)).await.unwrap();
        assert_eq!(outcome, PreseedOutcome::AlreadyPopulated);
        assert!(StatusWriter::new(dir.path().join("status"))
            .read("preseed_sonarr")
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_unreachable_replica_and_no_local_snapshot_fall_through_to_repository() {
        use crate::strategy::MockReplicaSource;
        use common::{ReplicationPolicy, Repository, RepositoryKind};
        use restic::fake::{ok, ScriptedRunner};
        use std::collections::BTreeMap;
        use zfs::fake::FakeZfs;

        let dir = tempfile::tempdir().unwrap();
        let password_file = dir.path().join("password");
        fs::write(&password_file, "hunter2").unwrap();

        let mut policies = BTreeMap::new();
        policies.insert(
            "tank/services".to_string(),
            ReplicationPolicy {
                target_host: "nas-1".to_string(),
                target_dataset: "backup/forge/zfs-recv".to_string(),
                send_options: "w".to_string(),
                recv_options: "u".to_string(),
                host_key: None,
                ssh_user: "zfs-replication".to_string(),
                ssh_key: None,
                ssh_port: 22,
            },
        );
        let mut replica = MockReplicaSource::new();
        replica.expect_latest_snapshot().returning(|_| {
            Err(StrategyError::Ssh(ssh::SshError::ConnectionError(
                "no route to host".to_string(),
            )))
        });
        replica.expect_pull().never();

        let volume = dir.path().join("sonarr");
        let zfs = Arc::new(FakeZfs::new().with_dataset("tank/services/sonarr", Some(volume.clone())));

        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "snapshots",
            ok(r#"[{"id":"c0ffee00c0ffee00","short_id":"c0ffee00","time":"2026-10-18T03:00:00Z","tags":["sonarr"]}]"#),
        );
        let mut config = CustodianConfig::default();
        config.cache_dir = dir.path().join("cache");

        let strategies: Vec<Box<dyn RestoreStrategy>> = vec![
            Box::new(ReplicaPull::new(policies, Arc::new(replica))),
            Box::new(LocalSnapshot::new(zfs.clone())),
            Box::new(RemoteRepository::new(config, runner.clone())),
        ];
        let orchestrator = orchestrator(&dir, strategies);
        let mut target = target(&volume);
        target.repository = Some(Repository {
            name: "nas-primary".to_string(),
            url: "/mnt/nas/restic".to_string(),
            password_file,
            environment_file: None,
            kind: RepositoryKind::Local,
            primary: true,
            display_name: None,
            location: None,
        });

        let PreseedOutcome::Restored { method, attempts } = orchestrator.run(&target).await.unwrap() else {
            panic!("expected a restore");
        };
        assert_eq!(method, RestoreMethod::RemoteRepository);
        assert!(matches!(&attempts[0].outcome, AttemptOutcome::Skipped(r) if r.contains("unreachable")));
        assert!(matches!(&attempts[1].outcome, AttemptOutcome::Skipped(r) if r.contains("no snapshots")));
        assert_eq!(runner.calls_to("restore").len(), 1);
        assert!(!zfs.calls().iter().any(|c| c.starts_with("rollback")));
    }

    #[test]
    fn test_volume_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(volume_is_empty(&dir.path().join("missing")).unwrap());
        fs::create_dir(dir.path().join("lost+found")).unwrap();
        assert!(volume_is_empty(dir.path()).unwrap());
        fs::write(dir.path().join("data"), "x").unwrap();
        assert!(!volume_is_empty(dir.path()).unwrap());
    }
}
