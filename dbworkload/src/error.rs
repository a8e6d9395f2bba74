use dbworkload_core::{ConfigError, WorkerFailure};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Worker failed, error_type={}, msg={}", .0.error_type, .0.message)]
    Worker(WorkerFailure),

    #[error("Mailbox of proc {0} is full, the poison pill could not be delivered")]
    MailboxFull(usize),

    #[error("Interrupted twice, forcing exit")]
    ForcedExit,

    #[error("Timed out waiting for final stats from {0} worker(s)")]
    DrainTimeout(usize),

    #[error("Inbound channel closed unexpectedly")]
    ChannelClosed,

    #[error("Failed to start proc: {0}")]
    ProcSpawn(#[source] std::io::Error),

    #[error("Report error: {0}")]
    Report(#[from] ReportError),
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Could not format timestamp: {0}")]
    Time(String),

    #[error("Invalid report data: {0}")]
    Config(#[from] ConfigError),
}

impl From<time::error::Format> for ReportError {
    fn from(err: time::error::Format) -> Self {
        Self::Time(err.to_string())
    }
}

impl From<time::error::ComponentRange> for ReportError {
    fn from(err: time::error::ComponentRange) -> Self {
        Self::Time(err.to_string())
    }
}
