use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser, Debug)]
#[clap(
    name = "custodian",
    about = "Snapshot-consistent backups, verification and disaster recovery",
    version
)]
struct Cli {
    /// Configuration file layered over the default locations
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run, verify, restore-test, list and report on restic backups
    Backup(restic::cli::Backup),

    /// Manage snapshot sessions of backup jobs
    Snapshot(zfs::cli::Snapshot),

    /// Seed an empty service volume before the service starts
    Preseed(preseed::cli::Preseed),

    /// Inspect replication topology
    Topology(commands::topology::Topology),

    /// Inspect the job registry
    Jobs(commands::jobs::Jobs),

    /// Maintain status records in the textfile collector directory
    Metrics(commands::metrics::Metrics),

    /// Show the effective configuration
    Config(commands::config::Config),
}

/// env_logger output, with records forwarded to Sentry when it is enabled
fn init_logging() {
    let logger = env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .format_level(true)
        .format_module_path(false)
        .format_indent(Some(4))
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .build();
    let level = logger.filter();
    let logger = sentry_log::SentryLogger::with_dest(logger);
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(level);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config = common::load_config(cli.config.as_deref()).context("Failed to load configuration")?;

    let _sentry = config.notify.sentry_dsn.as_deref().map(|dsn| {
        log::debug!("Reporting errors to Sentry");
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    match cli.command {
        Commands::Backup(backup) => backup.run(&config).await?,
        Commands::Snapshot(snapshot) => snapshot.run(&config).await?,
        Commands::Preseed(preseed) => preseed.run(&config).await?,
        Commands::Topology(topology) => topology.run(&config)?,
        Commands::Jobs(jobs) => jobs.run(&config)?,
        Commands::Metrics(metrics) => metrics.run(&config)?,
        Commands::Config(cmd) => cmd.run(&config)?,
    }

    Ok(())
}
