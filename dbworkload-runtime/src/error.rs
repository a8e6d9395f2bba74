use dbworkload::{ReportError, RunError};
use dbworkload_core::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("No workload named {name}, registered: {known}")]
    UnknownWorkload { name: String, known: String },

    #[error("Invalid connection parameter {0:?}, expected key=value")]
    ConnInfo(String),

    #[error("'--args' is neither a JSON object nor a path to one ({0}): {1}")]
    Args(String, #[source] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error("No CSV files found in {0}")]
    NoCsvFiles(String),
}
