use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A driver-agnostic database error.
///
/// Backends translate their native errors into this shape, keeping the SQLSTATE / errno (when the
/// driver has one) so the [`BackendFamily`](crate::BackendFamily) can classify it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{}", display_db_error(.code, .message))]
pub struct DbError {
    pub code: Option<String>,
    pub message: String,
}

impl DbError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }
}

fn display_db_error(code: &Option<String>, message: &str) -> String {
    match code {
        Some(code) => format!("[{code}] {message}"),
        None => message.to_string(),
    }
}

/// Startup-time configuration errors. None of these can happen once workers are running.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Schedule has no phases")]
    EmptySchedule,

    #[error("Phase {index} has no duration but is not the last phase")]
    UnboundedPhase { index: usize },

    #[error("Invalid phase '{0}', expected <concurrency>:<ramp_minutes>:<duration_minutes>")]
    InvalidPhase(String),

    #[error("Cannot merge digests with compression {left} and {right}")]
    CompressionMismatch { left: f64, right: f64 },

    #[error("Invalid digest compression {0}")]
    InvalidCompression(f64),

    #[error("At least one proc is required")]
    ZeroProcs,

    #[error("max_retries must be at least 1")]
    ZeroRetries,

    #[error("An iteration budget must be at least 1")]
    ZeroIterations,

    #[error("Invalid stats output directory: {0}")]
    OutputDir(String),

    #[error("Invalid centroid data: {0}")]
    InvalidCentroids(String),

    #[error("Invalid workload arguments: {0}")]
    Workload(String),
}
