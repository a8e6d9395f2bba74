#![doc = include_str!("../README.md")]

pub mod cli;
mod error;
pub mod runtime;

pub use crate::cli::{Cli, Command, MergeArgs, RunArgs};
pub use crate::error::RuntimeError;
pub use crate::runtime::{DbWorkloadRuntime, Launch};
