//! Status records in the textfile-collector exposition format.
//!
//! Every record is written to a temporary file in the target directory and
//! renamed over the final path, so readers only ever see complete records.

mod textfile;
mod writer;

pub use textfile::{parse, Labels, MetricKind, Sample, StatusRecord};
pub use writer::{StatusFile, StatusWriter};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to replace status file: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Malformed status line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("Invalid status record name: {0}")]
    InvalidName(String),
}

/// Seconds since the epoch, as used for timestamp gauges
pub fn unix_now() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_millis()) / 1000.0
}
