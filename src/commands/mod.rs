pub mod config;
pub mod jobs;
pub mod metrics;
pub mod topology;

use clap::ValueEnum;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}
