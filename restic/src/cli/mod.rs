use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Subcommand, ValueEnum};
use common::{CustodianConfig, JobRegistry, Repository};
use log::{error, info, warn};
use metrics::StatusWriter;
use std::future::Future;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};

use crate::list::{ListFilter, SnapshotListing};
use crate::report::StatusReport;
use crate::runner::SystemRunner;
use crate::verify::Verifier;
use crate::{BackupExecutor, ResticError};

#[derive(Debug, Args)]
pub struct Backup {
    #[clap(subcommand)]
    command: BackupCommands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ReportFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum BackupCommands {
    /// Run one backup job, or every registered job with --all
    Run {
        /// Backup job name
        #[clap(required_unless_present = "all")]
        job: Option<String>,

        #[clap(long, conflicts_with = "job")]
        all: bool,

        /// Start right away instead of after the configured random delay
        #[clap(long)]
        no_jitter: bool,
    },
    /// Check repository integrity (all repositories when none is given)
    Verify { repository: Option<String> },
    /// Restore a sample of files from the latest snapshot into scratch space
    RestoreTest { repository: Option<String> },
    /// Summarise every status record
    Report {
        #[clap(long, value_enum, default_value = "text")]
        format: ReportFormat,

        /// Exit non-zero when anything is failed or stale
        #[clap(long)]
        strict: bool,
    },
    /// Apply the retention policy of a job without backing up
    Prune { job: String },
    /// List the snapshots each backup job has in its repository
    List {
        /// Only jobs whose name contains this (case-insensitive)
        #[clap(long, short = 's')]
        service: Option<String>,

        /// Only jobs whose repository name contains this (case-insensitive)
        #[clap(long = "repo", short = 'r')]
        repository: Option<String>,

        /// Snapshots to show per job
        #[clap(long, short = 'n', default_value_t = 10)]
        limit: usize,

        #[clap(long, value_enum, default_value = "text")]
        format: ReportFormat,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Cancelled(&'static str);

/// Resolves with the signal's name on the first SIGINT or SIGTERM
fn shutdown_signal() -> Result<impl Future<Output = &'static str>> {
    let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    Ok(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => "interrupted",
            _ = term.recv() => "terminated",
        }
    })
}

/// Runs `work` until it finishes or SIGINT/SIGTERM arrives. Dropping the
/// future kills the restic child and releases any snapshot session.
async fn until_signalled<T>(work: impl Future<Output = Result<T>>) -> Result<T> {
    let shutdown = shutdown_signal()?;
    tokio::select! {
        result = work => result,
        reason = shutdown => Err(Cancelled(reason).into()),
    }
}

fn selected_repositories(verifier: &Verifier, name: Option<String>) -> Result<Vec<Repository>> {
    match name {
        Some(name) => Ok(vec![verifier.repository(&name)?]),
        None => Ok(verifier.repositories()),
    }
}

impl Backup {
    pub async fn run(self, config: &CustodianConfig) -> Result<()> {
        match self.command {
            BackupCommands::Run { job, all, no_jitter } => {
                let registry = JobRegistry::from_config(config)?;
                let mut executor = BackupExecutor::from_config(config);
                if no_jitter || all {
                    executor = executor.without_jitter();
                }

                let jobs: Vec<_> = match job {
                    Some(name) => vec![registry
                        .get(&name)
                        .ok_or_else(|| anyhow!("Unknown backup job: {name}"))?],
                    None => registry.iter().collect(),
                };

                let mut failed = Vec::new();
                for job in jobs {
                    match executor.run_until(job, shutdown_signal()?).await {
                        Ok(report) => {
                            if report.warnings > 0 {
                                warn!("{}: {} unreadable files", job.name, report.warnings);
                            }
                        }
                        Err(e @ ResticError::Cancelled(_)) => {
                            return Err(anyhow::Error::from(e)
                                .context(format!("Backup job {} cancelled", job.name)));
                        }
                        Err(e) => {
                            error!("{}: {e}", job.name);
                            failed.push(job.name.clone());
                        }
                    }
                }
                if !failed.is_empty() {
                    bail!("Backup failed for: {}", failed.join(", "));
                }
            }
            BackupCommands::Verify { repository } => {
                let verifier = Verifier::from_config(config);
                let mut failed = Vec::new();
                for repository in selected_repositories(&verifier, repository)? {
                    if let Err(e) = until_signalled(async {
                        verifier.check(&repository).await.map_err(anyhow::Error::from)
                    })
                    .await
                    {
                        error!("{}: {e:#}", repository.name);
                        failed.push(repository.name.clone());
                    }
                }
                if !failed.is_empty() {
                    bail!("Check failed for: {}", failed.join(", "));
                }
            }
            BackupCommands::RestoreTest { repository } => {
                let verifier = Verifier::from_config(config);
                let mut failed = Vec::new();
                for repository in selected_repositories(&verifier, repository)? {
                    match until_signalled(async {
                        verifier
                            .restore_test(&repository)
                            .await
                            .map_err(anyhow::Error::from)
                    })
                    .await
                    {
                        Ok(report) => info!(
                            "{}: restored {}/{} files",
                            repository.name,
                            report.restored,
                            report.sampled.len()
                        ),
                        Err(e) => {
                            error!("{}: {e:#}", repository.name);
                            failed.push(repository.name.clone());
                        }
                    }
                }
                if !failed.is_empty() {
                    bail!("Restore test failed for: {}", failed.join(", "));
                }
            }
            BackupCommands::Report { format, strict } => {
                let status = StatusWriter::new(config.status_dir.clone());
                let report = StatusReport::build(&status, config.stale_after_hours)?;
                match format {
                    ReportFormat::Text => print!("{}", report.render_text()),
                    ReportFormat::Json => println!("{}", report.to_json()?),
                }
                if strict && !report.is_healthy() {
                    bail!("Some backups need attention");
                }
            }
            BackupCommands::Prune { job } => {
                let registry = JobRegistry::from_config(config)?;
                let job = registry
                    .get(&job)
                    .ok_or_else(|| anyhow!("Unknown backup job: {job}"))?;
                let executor = BackupExecutor::from_config(config);
                until_signalled(async { executor.prune(job).await.map_err(anyhow::Error::from) })
                    .await
                    .with_context(|| format!("Failed to prune job {}", job.name))?;
            }
            BackupCommands::List {
                service,
                repository,
                limit,
                format,
            } => {
                let registry = JobRegistry::from_config(config)?;
                let filter = ListFilter {
                    job: service,
                    repository,
                    limit: limit.max(1),
                };
                let runner = SystemRunner::new(config.binaries.nice.clone(), config.binaries.ionice.clone());
                let listing = until_signalled(async {
                    SnapshotListing::collect(config, &registry, Arc::new(runner), &filter)
                        .await
                        .map_err(anyhow::Error::from)
                })
                .await?;
                if listing.jobs.is_empty() {
                    bail!("No backup jobs match the given filters");
                }
                match format {
                    ReportFormat::Text => print!("{}", listing.render_text()),
                    ReportFormat::Json => println!("{}", listing.to_json()?),
                }
                if !listing.is_complete() {
                    bail!("Some repositories could not be listed");
                }
            }
        }
        Ok(())
    }
}
