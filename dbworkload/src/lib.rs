#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod error;
mod proc;
mod ramp;
pub mod report;
mod supervisor;
mod timer;
#[doc(hidden)]
pub mod transaction;
mod worker;
mod workload;

#[cfg(test)]
mod testing;

pub use error::{ReportError, RunError};
pub use supervisor::Supervisor;
pub use timer::Cadence;
pub use transaction::{run_transaction, Outcome, RetryPolicy};
pub use workload::*;

pub use dbworkload_core as core;

pub mod prelude {
    pub use crate::error::RunError;
    pub use crate::supervisor::Supervisor;
    pub use crate::workload::{
        Backend, Connection, SetupContext, Transaction, Workload, WorkloadArgs, WorkloadFactory,
    };

    pub use dbworkload_core::{
        BackendFamily, ConfigError, ConnInfo, DbError, Phase, RunConfig, RunSummary, Schedule,
    };
}
