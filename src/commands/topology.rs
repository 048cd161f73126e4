use anyhow::{anyhow, Result};
use clap::{Args, Subcommand};
use common::{resolve, CustodianConfig};
use serde::Serialize;

use super::OutputFormat;

#[derive(Debug, Args)]
pub struct Topology {
    #[clap(subcommand)]
    command: TopologyCommands,
}

#[derive(Debug, Subcommand)]
pub enum TopologyCommands {
    /// Show the replication target a dataset inherits
    Resolve {
        dataset: String,

        #[clap(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Show the replication target of every service volume
    Plan {
        #[clap(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Debug, Serialize)]
struct PlanEntry {
    service: String,
    dataset: String,
    target_host: Option<String>,
    target_dataset: Option<String>,
    declared_on: Option<String>,
}

impl Topology {
    pub fn run(self, config: &CustodianConfig) -> Result<()> {
        match self.command {
            TopologyCommands::Resolve { dataset, format } => {
                let resolved = resolve(&config.replication, &dataset)
                    .ok_or_else(|| anyhow!("No replication policy covers {dataset}"))?;
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&resolved)?),
                    OutputFormat::Text => {
                        println!("{dataset}");
                        println!(
                            "    target:   {}:{}",
                            resolved.policy.target_host, resolved.policy.target_dataset
                        );
                        println!(
                            "    policy:   {}{}",
                            resolved.declared_on,
                            if resolved.is_inherited(&dataset) { " (inherited)" } else { "" }
                        );
                        println!("    ssh user: {}", resolved.policy.ssh_user);
                        println!(
                            "    host key: {}",
                            if resolved.policy.host_key.is_some() { "pinned" } else { "not pinned" }
                        );
                    }
                }
            }
            TopologyCommands::Plan { format } => {
                let plan: Vec<PlanEntry> = config
                    .services
                    .iter()
                    .filter_map(|(service, declared)| {
                        let dataset = declared.dataset.clone()?;
                        let resolved = resolve(&config.replication, &dataset);
                        Some(PlanEntry {
                            service: service.clone(),
                            target_host: resolved.as_ref().map(|r| r.policy.target_host.clone()),
                            target_dataset: resolved.as_ref().map(|r| r.policy.target_dataset.clone()),
                            declared_on: resolved.map(|r| r.declared_on),
                            dataset,
                        })
                    })
                    .collect();
                match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
                    OutputFormat::Text => {
                        for entry in &plan {
                            match (&entry.target_host, &entry.target_dataset) {
                                (Some(host), Some(target)) => {
                                    println!("{:<16} {} -> {host}:{target}", entry.service, entry.dataset)
                                }
                                _ => println!("{:<16} {} -> not replicated", entry.service, entry.dataset),
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
