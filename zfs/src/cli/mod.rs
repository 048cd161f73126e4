use anyhow::{anyhow, Context, Result};
use clap::{Args, Subcommand};
use common::{CustodianConfig, JobRegistry};
use log::info;

use crate::SnapshotManager;

#[derive(Debug, Args)]
pub struct Snapshot {
    #[clap(subcommand)]
    command: SnapshotCommands,
}

#[derive(Debug, Subcommand)]
pub enum SnapshotCommands {
    /// Create the snapshot session of a job and leave it mounted
    Acquire {
        /// Backup job name
        job: String,

        /// Dataset to snapshot (defaults to the job's volume)
        #[clap(long)]
        dataset: Option<String>,

        /// Process holding the session (defaults to the parent process)
        #[clap(long)]
        owner_pid: Option<i32>,
    },
    /// Tear down the snapshot session of a job
    Release {
        /// Backup job name
        job: String,
    },
    /// Release sessions whose owning process has died
    Gc,
}

impl Snapshot {
    pub async fn run(self, config: &CustodianConfig) -> Result<()> {
        let manager = SnapshotManager::from_config(config);

        match self.command {
            SnapshotCommands::Acquire {
                job,
                dataset,
                owner_pid,
            } => {
                let dataset = match dataset {
                    Some(dataset) => dataset,
                    None => {
                        let registry = JobRegistry::from_config(config)?;
                        let entry = registry
                            .get(&job)
                            .ok_or_else(|| anyhow!("Unknown backup job: {job}"))?;
                        entry
                            .volume
                            .clone()
                            .ok_or_else(|| anyhow!("Job {job} has no volume to snapshot"))?
                    }
                };
                let owner = owner_pid.unwrap_or_else(|| nix::unistd::getppid().as_raw());

                let lease = manager
                    .acquire_for(&dataset, &job, owner)
                    .with_context(|| format!("Failed to acquire snapshot session for {job}"))?;
                match lease {
                    Some(lease) => {
                        let session = lease.detach();
                        println!("{}", session.mountpoint.display());
                    }
                    None => info!("Dataset {dataset} not found, nothing to snapshot"),
                }
            }
            SnapshotCommands::Release { job } => {
                manager
                    .release(&job)
                    .with_context(|| format!("Failed to release snapshot session for {job}"))?;
                info!("Snapshot session for {job} released");
            }
            SnapshotCommands::Gc => {
                let released = manager.gc()?;
                if released.is_empty() {
                    info!("No orphaned snapshot sessions");
                }
                for job in released {
                    println!("{job}");
                }
            }
        }
        Ok(())
    }
}
