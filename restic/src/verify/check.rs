use chrono::{Duration as ChronoDuration, Utc};
use log::{error, info};
use serde::Serialize;
use std::time::Instant;

use common::Repository;
use metrics::StatusRecord;

use super::{flag, Verifier};
use crate::error::EXIT_REPO_MISSING;
use crate::wrapper::{RepositoryState, Restic};
use crate::{FailureKind, Result, ResticError};

/// Result of `custodian backup verify` for one repository
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub repository: String,
    pub healthy: bool,
    pub duration_secs: f64,
    pub snapshots_total: usize,
    pub snapshots_recent: usize,
    pub error: Option<String>,
}

impl Verifier {
    pub fn check_status_name(repository: &str) -> String {
        format!("restic_check_{repository}")
    }

    /// Connectivity, `restic check` and snapshot counts for `repository`
    pub async fn check(&self, repository: &Repository) -> Result<CheckReport> {
        info!("Checking repository {}", repository.name);
        let restic = self.restic(repository.clone());
        let started = Instant::now();
        let result = self.run_check(&restic).await;

        let mut report = CheckReport {
            repository: repository.name.clone(),
            healthy: result.is_ok(),
            duration_secs: started.elapsed().as_secs_f64(),
            snapshots_total: 0,
            snapshots_recent: 0,
            error: None,
        };
        match &result {
            Ok((total, recent)) => {
                report.snapshots_total = *total;
                report.snapshots_recent = *recent;
            }
            Err(e) => report.error = Some(e.to_string()),
        }

        if let Err(e) = self.write_check_status(repository, &report) {
            error!("Failed to write check status for {}: {e}", repository.name);
        }
        let message = match &report.error {
            None => Ok(format!(
                "{} snapshots, {} in the last 24h",
                report.snapshots_total, report.snapshots_recent
            )),
            Some(e) => Err(e.clone()),
        };
        self.notify("check", repository, message, report.duration_secs).await;

        match result {
            Ok(_) => {
                info!(
                    "Repository {} is healthy ({} snapshots)",
                    repository.name, report.snapshots_total
                );
                Ok(report)
            }
            Err(e) => {
                error!("Check of repository {} failed: {e}", repository.name);
                Err(e)
            }
        }
    }

    async fn run_check(&self, restic: &Restic) -> Result<(usize, usize)> {
        if restic.cat_config().await? == RepositoryState::Missing {
            return Err(ResticError::Command {
                command: "cat config".to_string(),
                status: Some(EXIT_REPO_MISSING),
                kind: FailureKind::PreconditionFailed,
                message: "repository does not exist".to_string(),
            });
        }
        restic
            .check(self.config.verification.read_data_subset.as_deref())
            .await?;

        let snapshots = restic.snapshots(&[], None).await?;
        let cutoff = Utc::now() - ChronoDuration::hours(24);
        let recent = snapshots.iter().filter(|s| s.time >= cutoff).count();
        Ok((snapshots.len(), recent))
    }

    fn write_check_status(&self, repository: &Repository, report: &CheckReport) -> Result<()> {
        let name = Self::check_status_name(&repository.name);
        let now = metrics::unix_now();
        let previous_success = self.status.read_value(&name, "restic_check_last_success_timestamp");
        let labels = self.labels(repository);

        let mut record = StatusRecord::new();
        record
            .gauge(
                "restic_check_status",
                "Outcome of the last repository check (1 = healthy, 0 = failed)",
                &labels,
                flag(report.healthy),
            )
            .gauge(
                "restic_check_last_run_timestamp",
                "Time the last repository check finished",
                &labels,
                now,
            )
            .gauge(
                "restic_check_last_success_timestamp",
                "Time of the last successful repository check",
                &labels,
                if report.healthy { now } else { previous_success.unwrap_or(0.0) },
            )
            .gauge(
                "restic_check_duration_seconds",
                "Duration of the last repository check",
                &labels,
                report.duration_secs,
            );
        if report.healthy {
            record
                .gauge(
                    "restic_check_snapshots_total",
                    "Snapshots in the repository",
                    &labels,
                    report.snapshots_total as f64,
                )
                .gauge(
                    "restic_check_snapshots_recent",
                    "Snapshots taken in the last 24 hours",
                    &labels,
                    report.snapshots_recent as f64,
                );
        }
        self.status.write(&name, &record)?;
        Ok(())
    }
}
