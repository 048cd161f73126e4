use anyhow::Result;
use clap::{Args, Subcommand};
use common::{CustodianConfig, JobRegistry};

use super::OutputFormat;

#[derive(Debug, Args)]
pub struct Jobs {
    #[clap(subcommand)]
    command: JobsCommands,
}

#[derive(Debug, Subcommand)]
pub enum JobsCommands {
    /// List every backup job, service-derived and manual
    List {
        #[clap(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl Jobs {
    pub fn run(self, config: &CustodianConfig) -> Result<()> {
        let registry = JobRegistry::from_config(config)?;
        match self.command {
            JobsCommands::List { format } => match format {
                OutputFormat::Json => {
                    let jobs: Vec<_> = registry.iter().collect();
                    println!("{}", serde_json::to_string_pretty(&jobs)?);
                }
                OutputFormat::Text => {
                    for job in registry.iter() {
                        println!("{} ({})", job.name, job.origin);
                        println!("    repository: {}", job.repository);
                        println!("    frequency:  {}", job.frequency);
                        for path in &job.paths {
                            println!("    path:       {}", path.display());
                        }
                        if !job.tags.is_empty() {
                            println!("    tags:       {}", job.tags.join(", "));
                        }
                        if job.use_snapshots {
                            println!(
                                "    snapshot:   {}",
                                job.volume.as_deref().unwrap_or("<no volume>")
                            );
                        }
                    }
                    if registry.is_empty() {
                        println!("No backup jobs configured");
                    }
                }
            },
        }
        Ok(())
    }
}
