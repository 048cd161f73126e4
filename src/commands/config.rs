use anyhow::Result;
use clap::{Args, Subcommand, ValueEnum};
use common::CustodianConfig;

#[derive(Debug, Args)]
pub struct Config {
    #[clap(subcommand)]
    command: ConfigCommands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ConfigFormat {
    Text,
    Json,
    Yaml,
    Toml,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    /// Print the configuration after layering files and environment
    Get {
        #[clap(long, value_enum, default_value = "text")]
        format: ConfigFormat,
    },
}

fn or_unset(value: Option<&str>) -> &str {
    value.unwrap_or("<not set>")
}

fn print_text(config: &CustodianConfig) {
    println!("Custodian Configuration:");
    println!("  Hostname: {}", or_unset(config.hostname.as_deref()));
    println!("  Status directory: {}", config.status_dir.display());
    println!("  Run directory: {}", config.run_dir.display());
    println!("  Snapshot mounts: {}", config.mount_base.display());
    println!("  Stale after: {}h", config.stale_after_hours);
    println!(
        "  Retention: {} daily, {} weekly, {} monthly, {} yearly",
        config.retention.daily, config.retention.weekly, config.retention.monthly, config.retention.yearly
    );
    println!("  Repositories:");
    for repository in config.repositories.values() {
        println!(
            "    {}{}: {}",
            repository.name,
            if repository.primary { " (primary)" } else { "" },
            repository.url
        );
    }
    println!("  Services:");
    for (name, service) in &config.services {
        println!(
            "    {name}: dataset {}, backup {}, preseed {}",
            or_unset(service.dataset.as_deref()),
            if service.backup.as_ref().is_some_and(|b| b.enable) { "on" } else { "off" },
            if service.preseed.as_ref().is_some_and(|p| p.enable) { "on" } else { "off" }
        );
    }
    println!("  Manual jobs: {}", config.jobs.len());
    println!("  Replication policies: {}", config.replication.len());
    println!(
        "  Sentry: {}",
        if config.notify.sentry_dsn.is_some() { "<set>" } else { "<not set>" }
    );
}

impl Config {
    pub fn run(self, config: &CustodianConfig) -> Result<()> {
        match self.command {
            ConfigCommands::Get { format } => match format {
                ConfigFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
                ConfigFormat::Yaml => println!("{}", serde_yaml::to_string(config)?),
                ConfigFormat::Toml => println!("{}", toml::to_string_pretty(config)?),
                ConfigFormat::Text => print_text(config),
            },
        }
        Ok(())
    }
}
