use anyhow::Result;
use clap::{Args, Subcommand};
use common::{CustodianConfig, JobRegistry};
use log::info;
use metrics::StatusWriter;
use std::time::Duration;

#[derive(Debug, Args)]
pub struct Metrics {
    #[clap(subcommand)]
    command: MetricsCommands,
}

#[derive(Debug, Subcommand)]
pub enum MetricsCommands {
    /// Remove status records of jobs that are no longer configured
    Reconcile,
    /// Remove status records that have not been rewritten for a while
    Sweep {
        /// Maximum age in days (defaults to `status_retention_days`)
        #[clap(long)]
        days: Option<u64>,
    },
}

impl Metrics {
    pub fn run(self, config: &CustodianConfig) -> Result<()> {
        let status = StatusWriter::new(config.status_dir.clone());
        let removed = match self.command {
            MetricsCommands::Reconcile => {
                let registry = JobRegistry::from_config(config)?;
                status.reconcile(registry.names())?
            }
            MetricsCommands::Sweep { days } => {
                let days = days.unwrap_or(config.status_retention_days);
                status.sweep(Duration::from_secs(days * 24 * 3600))?
            }
        };
        if removed.is_empty() {
            info!("No status records removed");
        }
        for name in removed {
            println!("{name}");
        }
        Ok(())
    }
}
