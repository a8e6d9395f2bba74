use crate::WorkerStats;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a freshly spawned worker needs to know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Globally increasing, unique for the run.
    pub id: usize,
    /// Cycles this worker may run before reporting `TaskDone`.
    pub iterations: Option<u64>,
    /// Total concurrency of the run, passed to the workload's setup hook.
    pub concurrency: usize,
}

/// Sent to a single proc's mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    SpawnWorker(WorkerSpec),
    KillOneWorker,
    /// Poison pill: stop every worker, join them, report `ProcReturned`.
    Terminate,
}

/// A worker-level error that made it across the proc boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{error_type}: {message}")]
pub struct WorkerFailure {
    /// `None` when the failure belongs to the proc rather than a worker.
    pub worker: Option<usize>,
    pub error_type: String,
    pub message: String,
}

impl WorkerFailure {
    pub fn new(worker: Option<usize>, error_type: &str, message: impl Into<String>) -> Self {
        Self {
            worker,
            error_type: error_type.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsReport {
    pub worker: usize,
    pub stats: WorkerStats,
    /// Set on the snapshot a worker sends after its terminal lifecycle event.
    pub last: bool,
}

/// Everything that flows from workers and procs to the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Init { worker: usize },
    TaskDone { worker: usize },
    GotKilled { worker: usize },
    ProcReturned { proc_id: usize },
    Fatal(WorkerFailure),
    Stats(StatsReport),
}

