//! Snapshots of each backup job, as stored in its repository.

use chrono::SecondsFormat;
use log::{debug, warn};
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;

use common::{BackupJob, CustodianConfig, JobRegistry};

use crate::runner::CommandRunner;
use crate::wrapper::{Restic, SnapshotInfo};
use crate::Result;

/// Which jobs to list and how many snapshots each
#[derive(Debug, Clone)]
pub struct ListFilter {
    /// Case-insensitive substring of the job name
    pub job: Option<String>,
    /// Case-insensitive substring of the repository name
    pub repository: Option<String>,
    pub limit: usize,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            job: None,
            repository: None,
            limit: 10,
        }
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

impl ListFilter {
    pub fn matches(&self, job: &BackupJob) -> bool {
        self.job
            .as_deref()
            .map_or(true, |wanted| contains_ignore_case(&job.name, wanted))
            && self
                .repository
                .as_deref()
                .map_or(true, |wanted| contains_ignore_case(&job.repository, wanted))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshots {
    pub job: String,
    pub repository: String,
    pub repository_name: String,
    /// Newest first
    pub snapshots: Vec<SnapshotInfo>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ListingSummary {
    pub total_jobs: usize,
    pub listed_jobs: usize,
    pub total_snapshots: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotListing {
    pub jobs: Vec<JobSnapshots>,
    pub summary: ListingSummary,
}

impl SnapshotListing {
    /// Runs `restic snapshots` once per matching job. A repository that
    /// cannot be read is recorded on its job and does not stop the listing.
    pub async fn collect(
        config: &CustodianConfig,
        registry: &JobRegistry,
        runner: Arc<dyn CommandRunner>,
        filter: &ListFilter,
    ) -> Result<Self> {
        let mut jobs = Vec::new();
        let mut summary = ListingSummary::default();

        for job in registry.iter().filter(|job| filter.matches(job)) {
            summary.total_jobs += 1;
            let Some(repository) = config.repository(&job.repository) else {
                jobs.push(JobSnapshots {
                    job: job.name.clone(),
                    repository: job.repository.clone(),
                    repository_name: job.repository.clone(),
                    snapshots: Vec::new(),
                    error: Some(format!("Repository '{}' is not configured", job.repository)),
                });
                continue;
            };
            let repository_name = repository.display_name();
            let restic = Restic::from_config(config, repository.clone(), runner.clone());

            debug!("Listing snapshots of job {} in {}", job.name, job.repository);
            let (snapshots, error) = match restic.snapshots(&job.tags, Some(filter.limit)).await {
                Ok(mut snapshots) => {
                    snapshots.reverse();
                    snapshots.truncate(filter.limit);
                    summary.listed_jobs += 1;
                    summary.total_snapshots += snapshots.len();
                    (snapshots, None)
                }
                Err(e) => {
                    warn!("Could not list snapshots of job {}: {e}", job.name);
                    (Vec::new(), Some(e.to_string()))
                }
            };
            jobs.push(JobSnapshots {
                job: job.name.clone(),
                repository: job.repository.clone(),
                repository_name,
                snapshots,
                error,
            });
        }

        Ok(Self { jobs, summary })
    }

    /// Every matching job could be listed
    pub fn is_complete(&self) -> bool {
        self.jobs.iter().all(|j| j.error.is_none())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for job in &self.jobs {
            let _ = writeln!(out, "{} ({})", job.job, job.repository_name);
            if let Some(error) = &job.error {
                let _ = writeln!(out, "  Error: {error}");
            } else if job.snapshots.is_empty() {
                out.push_str("  No snapshots found\n");
            } else {
                let _ = writeln!(out, "  {:<10}{:<22}{:<16}TAGS", "ID", "TIME", "HOST");
                for snapshot in &job.snapshots {
                    let id: String = if snapshot.short_id.is_empty() {
                        snapshot.id.chars().take(8).collect()
                    } else {
                        snapshot.short_id.clone()
                    };
                    let time = snapshot.time.to_rfc3339_opts(SecondsFormat::Secs, true);
                    let tags = snapshot.tags.as_deref().unwrap_or_default().join(",");
                    let line = format!("  {id:<10}{time:<22}{:<16}{tags}", snapshot.hostname);
                    let _ = writeln!(out, "{}", line.trim_end());
                }
            }
            out.push('\n');
        }
        let _ = writeln!(
            out,
            "{} snapshots across {}/{} jobs",
            self.summary.total_snapshots, self.summary.listed_jobs, self.summary.total_jobs
        );
        out
    }
}
