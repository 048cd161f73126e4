//! Runs one backup job end to end: lock, jitter, repository init, optional
//! snapshot session, backup with retry, retention pruning, status record and
//! notification.

use log::{debug, error, info, warn};
use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{BackupJob, CustodianConfig, Repository};
use metrics::{Labels, StatusRecord, StatusWriter};
use zfs::{SnapshotLease, SnapshotManager};

use crate::lock::JobLock;
use crate::notify::{Event, EventStatus, Notifier, Notifiers};
use crate::runner::{CommandRunner, SystemRunner};
use crate::wrapper::{BackupOutcome, BackupRequest, BackupSummary, Restic};
use crate::{FailureKind, Result, ResticError};

/// What happened during one job run
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub job: String,
    pub repository: String,
    pub status: EventStatus,
    pub attempts: u32,
    pub duration_secs: f64,
    pub repository_healthy: bool,
    pub snapshot_used: bool,
    pub summary: Option<BackupSummary>,
    pub warnings: u64,
    pub pruned: bool,
    pub snapshots_total: Option<usize>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
}

impl BackupReport {
    fn event(&self) -> Event {
        let message = match (&self.error, &self.summary) {
            (Some(error), _) => error.clone(),
            (None, _) if self.warnings > 0 => {
                format!("completed with {} unreadable files", self.warnings)
            }
            (None, Some(summary)) => format!(
                "{} files, {} bytes processed, {} bytes added",
                summary.total_files_processed, summary.total_bytes_processed, summary.data_added
            ),
            (None, None) => "completed".to_string(),
        };
        Event {
            operation: "backup".to_string(),
            subject: self.job.clone(),
            repository: Some(self.repository.clone()),
            status: self.status,
            message,
            duration_secs: self.duration_secs,
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    attempts: u32,
    repository_healthy: bool,
    snapshot_used: bool,
}

struct Completed {
    outcome: BackupOutcome,
    pruned: bool,
    snapshots_total: Option<usize>,
}

pub struct BackupExecutor {
    config: CustodianConfig,
    runner: Arc<dyn CommandRunner>,
    snapshots: SnapshotManager,
    status: StatusWriter,
    notifier: Arc<dyn Notifier>,
    hostname: String,
    jitter: bool,
}

impl BackupExecutor {
    pub fn new(
        config: CustodianConfig,
        runner: Arc<dyn CommandRunner>,
        snapshots: SnapshotManager,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let status = StatusWriter::new(config.status_dir.clone());
        let hostname = crate::hostname(config.hostname.as_deref());
        Self {
            config,
            runner,
            snapshots,
            status,
            notifier,
            hostname,
            jitter: true,
        }
    }

    pub fn from_config(config: &CustodianConfig) -> Self {
        let runner = SystemRunner::new(config.binaries.nice.clone(), config.binaries.ionice.clone());
        Self::new(
            config.clone(),
            Arc::new(runner),
            SnapshotManager::from_config(config),
            Arc::new(Notifiers::from_config(&config.notify)),
        )
    }

    /// Starts immediately instead of after a random delay
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn status_name(job: &str) -> String {
        format!("restic_backup_{job}")
    }

    fn repository(&self, name: &str) -> Result<Repository> {
        self.config
            .repository(name)
            .cloned()
            .ok_or_else(|| ResticError::UnknownRepository(name.to_string()))
    }

    fn restic(&self, repository: Repository, job: &BackupJob) -> Restic {
        Restic::from_config(&self.config, repository, self.runner.clone())
            .with_resources(job.resources.clone())
    }

    /// Runs `job`. A status record is written and notifiers are called
    /// whatever the outcome.
    pub async fn run(&self, job: &BackupJob) -> Result<BackupReport> {
        self.run_until(job, std::future::pending()).await
    }

    /// Like [`run`](Self::run), but gives up when `shutdown` resolves. The
    /// cancelled run is recorded as a failure naming the reason.
    pub async fn run_until<S>(&self, job: &BackupJob, shutdown: S) -> Result<BackupReport>
    where
        S: Future<Output = &'static str>,
    {
        let _lock = match JobLock::acquire(&self.config.run_dir, &job.name) {
            Ok(lock) => lock,
            Err(ResticError::AlreadyRunning(name)) => {
                // the running instance owns the status record
                warn!("Backup job {name} is already running, skipping this run");
                self.notifier
                    .notify(&Event {
                        operation: "backup".to_string(),
                        subject: name.clone(),
                        repository: Some(job.repository.clone()),
                        status: EventStatus::Warning,
                        message: "skipped, another run holds the job lock".to_string(),
                        duration_secs: 0.0,
                    })
                    .await;
                return Err(ResticError::AlreadyRunning(name));
            }
            Err(e) => {
                return self
                    .finish(job, None, &Progress::default(), Duration::ZERO, Err(e))
                    .await
            }
        };
        let repository = match self.repository(&job.repository) {
            Ok(repository) => repository,
            Err(e) => {
                return self
                    .finish(job, None, &Progress::default(), Duration::ZERO, Err(e))
                    .await
            }
        };

        tokio::pin!(shutdown);
        if self.jitter && self.config.backup.jitter_secs > 0 {
            let delay = rand::rng().random_range(0..=self.config.backup.jitter_secs);
            info!("Delaying backup job {} by {delay}s", job.name);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                reason = &mut shutdown => {
                    let cancelled = Err(ResticError::Cancelled(reason.to_string()));
                    return self
                        .finish(job, Some(&repository), &Progress::default(), Duration::ZERO, cancelled)
                        .await;
                }
            }
        }

        info!(
            "Starting backup job {} ({}) to repository {}",
            job.name, job.origin, repository.name
        );
        let restic = self.restic(repository.clone(), job);
        let started = Instant::now();
        let mut progress = Progress::default();

        let result = {
            let work = async {
                let execute = self.execute(job, &restic, &mut progress);
                match job.resources.timeout_secs {
                    Some(secs) => tokio::time::timeout(Duration::from_secs(secs), execute)
                        .await
                        .unwrap_or_else(|_| {
                            Err(ResticError::Timeout {
                                job: job.name.clone(),
                                secs,
                            })
                        }),
                    None => execute.await,
                }
            };
            tokio::select! {
                result = work => result,
                reason = &mut shutdown => {
                    warn!("Backup job {} {reason}, stopping restic", job.name);
                    Err(ResticError::Cancelled(reason.to_string()))
                }
            }
        };

        self.finish(job, Some(&repository), &progress, started.elapsed(), result)
            .await
    }

    /// Records the outcome of a run: status record, notification and log line
    async fn finish(
        &self,
        job: &BackupJob,
        repository: Option<&Repository>,
        progress: &Progress,
        elapsed: Duration,
        result: Result<Completed>,
    ) -> Result<BackupReport> {
        let report = build_report(job, progress, elapsed, &result);
        if let Err(e) = self.write_status(job, repository, &report) {
            error!("Failed to write status record for job {}: {e}", job.name);
        }
        self.notifier.notify(&report.event()).await;

        match result {
            Ok(_) => {
                info!(
                    "Backup job {} finished in {:.1}s after {} attempt(s)",
                    job.name, report.duration_secs, report.attempts
                );
                Ok(report)
            }
            Err(e) => {
                error!("Backup job {} failed: {e}", job.name);
                Err(e)
            }
        }
    }

    async fn execute(&self, job: &BackupJob, restic: &Restic, progress: &mut Progress) -> Result<Completed> {
        let mut contacts = 0;
        self.with_retry("Repository contact", &mut contacts, move || {
            restic.ensure_initialized()
        })
        .await?;
        progress.repository_healthy = true;

        let lease = match (&job.volume, job.use_snapshots) {
            (Some(volume), true) => self.snapshots.acquire(volume, &job.name)?,
            _ => None,
        };
        progress.snapshot_used = lease.is_some();

        let request = BackupRequest {
            paths: backup_paths(job, lease.as_ref()),
            tags: job.tags.clone(),
            exclude: job.exclude.clone(),
        };
        let request = &request;
        let outcome = self
            .with_retry("Backup", &mut progress.attempts, move || restic.backup(request))
            .await;
        drop(lease);
        let outcome = outcome?;

        if outcome.partial {
            let errors = outcome.error_count();
            let limit = self.config.backup.partial_max_errors;
            if errors > limit {
                return Err(ResticError::TooManyErrors { errors, limit });
            }
            warn!("Backup job {} could not read {errors} file(s)", job.name);
            for item in outcome.errors.iter().take(10) {
                warn!("  {item}");
            }
        }

        let pruned = match restic.forget(&job.tags, &self.config.retention).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Retention pruning for job {} failed: {e}", job.name);
                false
            }
        };

        let snapshots_total = match restic.snapshots(&job.tags, None).await {
            Ok(snapshots) => Some(snapshots.len()),
            Err(e) => {
                debug!("Could not count snapshots of job {}: {e}", job.name);
                None
            }
        };

        Ok(Completed {
            outcome,
            pruned,
            snapshots_total,
        })
    }

    /// Runs `op`, retrying transient failures with exponential backoff until
    /// `max_attempts` calls have been made. `attempts` counts the calls.
    async fn with_retry<T, F, Fut>(&self, what: &str, attempts: &mut u32, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.backup.max_attempts.max(1);
        loop {
            *attempts += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && *attempts < max_attempts => {
                    let delay = self.retry_delay(*attempts);
                    warn!(
                        "{what} attempt {}/{max_attempts} failed: {e}; retrying in {}s",
                        *attempts,
                        delay.as_secs()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(10);
        Duration::from_secs(self.config.backup.retry_base_secs.saturating_mul(factor))
    }

    /// Retention pruning without a backup
    pub async fn prune(&self, job: &BackupJob) -> Result<()> {
        let _lock = JobLock::acquire(&self.config.run_dir, &job.name)?;
        let restic = self.restic(self.repository(&job.repository)?, job);
        info!("Pruning snapshots of job {}", job.name);
        restic.forget(&job.tags, &self.config.retention).await
    }

    fn labels(&self, job: &BackupJob, repository: Option<&Repository>) -> Labels {
        let (display_name, location) = match repository {
            Some(repository) => (repository.display_name(), repository.location()),
            None => (job.repository.clone(), "unknown".to_string()),
        };
        Labels::new()
            .with("backup_job", job.name.as_str())
            .with("repository", job.repository.as_str())
            .with("repository_name", display_name)
            .with("repository_location", location)
            .with("hostname", self.hostname.as_str())
    }

    fn write_status(&self, job: &BackupJob, repository: Option<&Repository>, report: &BackupReport) -> Result<()> {
        let name = Self::status_name(&job.name);
        let previous_success = self
            .status
            .read_value(&name, "restic_backup_last_success_timestamp");
        let now = metrics::unix_now();
        let success = report.status != EventStatus::Failure;
        let flag = |b: bool| if b { 1.0 } else { 0.0 };

        let labels = self.labels(job, repository);

        let mut record = StatusRecord::new();
        record
            .gauge(
                "restic_backup_status",
                "Outcome of the last backup run (1 = success, 0 = failure)",
                &labels,
                flag(success),
            )
            .gauge(
                "restic_backup_last_run_timestamp",
                "Time the last backup run finished",
                &labels,
                now,
            )
            .gauge(
                "restic_backup_last_success_timestamp",
                "Time of the last successful backup",
                &labels,
                if success { now } else { previous_success.unwrap_or(0.0) },
            )
            .gauge(
                "restic_backup_duration_seconds",
                "Duration of the last backup run",
                &labels,
                report.duration_secs,
            )
            .gauge(
                "restic_backup_attempts",
                "Attempts used by the last backup run",
                &labels,
                f64::from(report.attempts),
            )
            .gauge(
                "restic_backup_warnings",
                "Source files the last backup run could not read",
                &labels,
                report.warnings as f64,
            )
            .gauge(
                "restic_backup_repo_healthy",
                "Whether the repository answered before the backup",
                &labels,
                flag(report.repository_healthy),
            )
            .gauge(
                "restic_backup_snapshot_used",
                "Whether the backup read from a filesystem snapshot",
                &labels,
                flag(report.snapshot_used),
            );
        if let Some(summary) = &report.summary {
            record
                .gauge(
                    "restic_backup_files_total",
                    "Files processed by the last backup",
                    &labels,
                    summary.total_files_processed as f64,
                )
                .gauge(
                    "restic_backup_size_bytes",
                    "Bytes processed by the last backup",
                    &labels,
                    summary.total_bytes_processed as f64,
                )
                .gauge(
                    "restic_backup_added_bytes",
                    "Bytes added to the repository by the last backup",
                    &labels,
                    summary.data_added as f64,
                );
        }
        if let Some(total) = report.snapshots_total {
            record.gauge(
                "restic_backup_snapshots_total",
                "Snapshots of this job kept in the repository",
                &labels,
                total as f64,
            );
        }

        self.status.write(&name, &record)?;
        Ok(())
    }
}

fn backup_paths(job: &BackupJob, lease: Option<&SnapshotLease>) -> Vec<PathBuf> {
    let Some(lease) = lease else {
        return job.paths.clone();
    };
    let session = lease.session();
    job.paths
        .iter()
        .map(|path| match session.remap(path) {
            Some(remapped) => remapped,
            None => {
                warn!(
                    "{} is outside dataset {}, backing up the live path",
                    path.display(),
                    session.dataset
                );
                path.clone()
            }
        })
        .collect()
}

fn build_report(
    job: &BackupJob,
    progress: &Progress,
    elapsed: Duration,
    result: &Result<Completed>,
) -> BackupReport {
    let mut report = BackupReport {
        job: job.name.clone(),
        repository: job.repository.clone(),
        status: EventStatus::Success,
        attempts: progress.attempts,
        duration_secs: elapsed.as_secs_f64(),
        repository_healthy: progress.repository_healthy,
        snapshot_used: progress.snapshot_used,
        summary: None,
        warnings: 0,
        pruned: false,
        snapshots_total: None,
        error: None,
        failure: None,
    };
    match result {
        Ok(done) => {
            report.summary = done.outcome.summary.clone();
            report.pruned = done.pruned;
            report.snapshots_total = done.snapshots_total;
            if done.outcome.partial {
                report.warnings = done.outcome.error_count();
                report.status = EventStatus::Warning;
            }
        }
        Err(e) => {
            report.status = EventStatus::Failure;
            report.error = Some(e.to_string());
            report.failure = Some(e.kind());
            if let ResticError::TooManyErrors { errors, .. } = e {
                report.warnings = *errors;
            }
        }
    }
    report
}
