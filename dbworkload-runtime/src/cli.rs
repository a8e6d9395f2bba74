//! Command line surface.
use crate::error::RuntimeError;
use clap::{Args, Parser, Subcommand};
use dbworkload::WorkloadArgs;
use dbworkload_core::{BackendFamily, ConnInfo, Phase, RunConfig, Schedule};
use std::num::NonZeroU64;
use std::path::PathBuf;
use std::time::Duration;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

pub(crate) const DEFAULT_PORT: u16 = 26260;

#[derive(Parser, Debug)]
#[command(version, about = "Run a transaction workload against a database")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log filter, overridden by `RUST_LOG`.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a registered workload.
    Run(RunArgs),
    /// Re-aggregate the CSV reports of several runs into `<first>.merged.csv`.
    MergeCsvs(MergeArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Registered workload name.
    #[arg(short, long)]
    pub workload: String,

    /// Connection URI, or `key=value` pairs separated by commas.
    #[arg(short, long, default_value = "")]
    pub uri: String,

    /// Backend family when `--uri` is not a URI.
    #[arg(long)]
    pub driver: Option<BackendFamily>,

    /// `application_name` set on URI connections. Defaults to the workload name.
    #[arg(long)]
    pub app_name: Option<String>,

    /// Unset autocommit on the connections.
    #[arg(long)]
    pub no_autocommit: bool,

    /// Number of procs. Defaults to the available parallelism.
    #[arg(short('x'), long)]
    pub procs: Option<usize>,

    #[arg(short, long, default_value_t = 1)]
    pub concurrency: usize,

    /// Seconds to reach `--concurrency`.
    #[arg(short, long, default_value_t = 0)]
    pub ramp: u64,

    /// Total iterations across all workers.
    #[arg(short, long)]
    pub iterations: Option<u64>,

    /// Seconds to run for. Runs until interrupted when unset.
    #[arg(short, long)]
    pub duration: Option<u64>,

    /// Seconds before a connection is closed and reopened.
    #[arg(short('k'), long)]
    pub conn_duration: Option<u64>,

    /// Seconds between reports, 0 disables them.
    #[arg(short, long, default_value_t = 10)]
    pub stats_frequency: u64,

    /// Phases as `concurrency:ramp_minutes:duration_minutes`, overriding
    /// `--concurrency`, `--ramp` and `--duration`.
    #[arg(long)]
    pub schedule: Vec<Phase>,

    /// Workload arguments, as a JSON string or a path to a JSON file.
    #[arg(short, long)]
    pub args: Option<String>,

    /// Do not print periodic reports.
    #[arg(short, long)]
    pub quiet: bool,

    /// Save reports to `<output-dir>/<run_name>.csv` and `.txt`.
    #[arg(long)]
    pub save: bool,

    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Prometheus exporter port, 0 disables it.
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

#[derive(Args, Debug)]
pub struct MergeArgs {
    /// Directory holding the CSV files to merge.
    #[arg(long)]
    pub input_dir: PathBuf,

    /// Window length the runs reported with, in seconds.
    #[arg(short, long, default_value = "10")]
    pub stats_frequency: NonZeroU64,
}

impl RunArgs {
    pub fn run_config(&self) -> Result<RunConfig, RuntimeError> {
        let mut config = RunConfig::new(&self.workload)
            .concurrency(self.concurrency)
            .ramp(Duration::from_secs(self.ramp))
            .stats_frequency(NonZeroU64::new(self.stats_frequency))
            .quiet(self.quiet)
            .save(self.save)
            .output_dir(&self.output_dir);

        if let Some(procs) = self.procs {
            config = config.procs(procs);
        }
        if let Some(iterations) = self.iterations {
            config = config.iterations(iterations);
        }
        if let Some(duration) = self.duration {
            config = config.duration(Duration::from_secs(duration));
        }
        if let Some(conn_duration) = self.conn_duration {
            config = config.conn_duration(Duration::from_secs(conn_duration));
        }
        if !self.schedule.is_empty() {
            config = config.schedule(Schedule::new(self.schedule.clone())?);
        }

        config.validate()?;
        Ok(config)
    }

    /// The family named by the URI scheme, else by `--driver`.
    pub fn family(&self) -> Option<BackendFamily> {
        BackendFamily::from_uri(&self.uri).or(self.driver)
    }

    pub fn conn_info(&self) -> Result<ConnInfo, RuntimeError> {
        let mut info = ConnInfo::new().extra("autocommit", &(!self.no_autocommit).to_string());

        if self.uri.contains("://") {
            let app_name = self.app_name.as_deref().unwrap_or(&self.workload);
            let uri = with_query_param(&self.uri, "application_name", app_name);
            let key = match self.family() {
                Some(BackendFamily::Postgres) => "conninfo",
                Some(BackendFamily::Mongo) => "host",
                _ => "uri",
            };
            info = info.param(key, &uri);
        } else {
            for pair in self.uri.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let (k, v) = pair
                    .split_once('=')
                    .ok_or_else(|| RuntimeError::ConnInfo(pair.to_string()))?;
                info = info.param(k.trim(), v.trim());
            }
        }
        Ok(info)
    }

    pub fn workload_args(&self) -> Result<WorkloadArgs, RuntimeError> {
        let Some(args) = &self.args else {
            return Ok(WorkloadArgs::new());
        };
        let path = PathBuf::from(args);
        let text = if path.is_file() {
            std::fs::read_to_string(&path)?
        } else {
            args.clone()
        };
        let value: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| RuntimeError::Args(args.clone(), e))?;
        Ok(WorkloadArgs::from_value(value)?)
    }
}

/// Sets `key=value` in the URI query, replacing an existing value.
fn with_query_param(uri: &str, key: &str, value: &str) -> String {
    let (base, fragment) = match uri.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (uri, None),
    };
    let (path, query) = base.split_once('?').unwrap_or((base, ""));
    let mut pairs: Vec<String> = query
        .split('&')
        .filter(|p| !p.is_empty() && p.split('=').next() != Some(key))
        .map(str::to_string)
        .collect();
    pairs.push(format!("{key}={value}"));

    let mut out = format!("{path}?{}", pairs.join("&"));
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    out
}
