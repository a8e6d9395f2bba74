mod backend;
mod config;
mod constants;
mod digest;
mod error;
mod message;
mod schedule;
mod stats;
mod worker_stats;

pub use backend::*;
pub use config::*;
pub use constants::*;
pub use digest::*;
pub use error::*;
pub use message::*;
pub use schedule::*;
pub use stats::*;
pub use worker_stats::*;
