use crate::{
    ConfigError, Schedule, DEFAULT_COMPRESSION, DEFAULT_MAX_RETRIES, DEFAULT_RECONNECT_DELAY,
    DEFAULT_RETRY_BASE_DELAY, DEFAULT_STATS_FREQUENCY,
};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use std::collections::BTreeMap;
use std::num::NonZeroU64;
use std::path::PathBuf;
use std::time::Duration;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// Connection parameters handed read-only to every worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnInfo {
    pub params: BTreeMap<String, String>,
    /// Driver-specific flags such as `autocommit` or `application_name`.
    pub extras: BTreeMap<String, String>,
}

impl ConnInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn extra(mut self, key: &str, value: &str) -> Self {
        self.extras.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn get_extra(&self, key: &str) -> Option<&str> {
        self.extras.get(key).map(String::as_str)
    }
}

#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfig {
    pub workload: String,
    pub concurrency: usize,
    #[serde_as(as = "DurationSeconds")]
    pub ramp: Duration,
    #[serde_as(as = "Option<DurationSeconds>")]
    pub duration: Option<Duration>,
    /// Overrides `concurrency`, `ramp` and `duration` when set.
    pub schedule: Option<Schedule>,
    /// Total iteration budget across all workers.
    pub iterations: Option<u64>,
    pub procs: usize,
    #[serde_as(as = "Option<DurationSeconds>")]
    pub conn_duration: Option<Duration>,
    /// Seconds between reports. `None` disables periodic reporting.
    pub stats_frequency: Option<NonZeroU64>,
    pub quiet: bool,
    pub save: bool,
    pub output_dir: PathBuf,
    pub max_retries: u32,
    #[serde_as(as = "DurationMilliSeconds")]
    pub retry_base_delay: Duration,
    #[serde_as(as = "DurationMilliSeconds")]
    pub reconnect_delay: Duration,
    pub compression: f64,
}

impl RunConfig {
    pub fn new(workload: &str) -> Self {
        Self {
            workload: workload.to_string(),
            concurrency: 1,
            ramp: Duration::ZERO,
            duration: None,
            schedule: None,
            iterations: None,
            procs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            conn_duration: None,
            stats_frequency: Some(DEFAULT_STATS_FREQUENCY),
            quiet: false,
            save: false,
            output_dir: PathBuf::from("."),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            compression: DEFAULT_COMPRESSION,
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn ramp(mut self, ramp: Duration) -> Self {
        self.ramp = ramp;
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn iterations(mut self, iterations: u64) -> Self {
        self.iterations = Some(iterations);
        self
    }

    pub fn procs(mut self, procs: usize) -> Self {
        self.procs = procs;
        self
    }

    pub fn conn_duration(mut self, conn_duration: Duration) -> Self {
        self.conn_duration = Some(conn_duration);
        self
    }

    pub fn stats_frequency(mut self, secs: Option<NonZeroU64>) -> Self {
        self.stats_frequency = secs;
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn save(mut self, save: bool) -> Self {
        self.save = save;
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn compression(mut self, compression: f64) -> Self {
        self.compression = compression;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.procs == 0 {
            return Err(ConfigError::ZeroProcs);
        }
        if self.max_retries == 0 {
            return Err(ConfigError::ZeroRetries);
        }
        if self.iterations == Some(0) {
            return Err(ConfigError::ZeroIterations);
        }
        if !self.compression.is_finite() || self.compression < 1. {
            return Err(ConfigError::InvalidCompression(self.compression));
        }
        if self.save && self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::OutputDir(
                self.output_dir.display().to_string(),
            ));
        }
        if let Some(schedule) = &self.schedule {
            Schedule::new(schedule.phases().to_vec())?;
        }
        Ok(())
    }

    /// Resolve the schedule and split the iteration budget across workers.
    pub fn plan(&self) -> Result<RunPlan, ConfigError> {
        self.validate()?;

        let schedule = match &self.schedule {
            Some(schedule) => schedule.clone(),
            None => Schedule::single(self.concurrency, self.ramp, self.duration),
        };

        let (iterations_per_worker, dropped_iterations) = match self.iterations {
            Some(iterations) => {
                let workers = (schedule.peak_concurrency() as u64).clamp(1, iterations);
                let per_worker = iterations / workers;
                let dropped = iterations % workers;
                if dropped > 0 {
                    warn!(
                        "{iterations} iterations do not divide evenly across {workers} workers, \
                         {dropped} will not run"
                    );
                }
                (Some(per_worker), dropped)
            }
            None => (None, 0),
        };

        // An iteration budget smaller than the requested concurrency caps the concurrency.
        let schedule = match self.iterations {
            Some(iterations) if (schedule.peak_concurrency() as u64) > iterations => {
                let cap = iterations as usize;
                Schedule::new(
                    schedule
                        .iter()
                        .map(|p| crate::Phase {
                            concurrency: p.concurrency.min(cap),
                            ..p.clone()
                        })
                        .collect(),
                )?
            }
            _ => schedule,
        };

        Ok(RunPlan {
            schedule,
            iterations_per_worker,
            dropped_iterations,
        })
    }
}

/// The resolved shape of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    pub schedule: Schedule,
    pub iterations_per_worker: Option<u64>,
    pub dropped_iterations: u64,
}

impl RunPlan {
    pub fn peak_concurrency(&self) -> usize {
        self.schedule.peak_concurrency()
    }
}
