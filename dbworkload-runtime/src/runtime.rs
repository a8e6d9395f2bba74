//! Default dbworkload runtime
//!
//! Wraps the supervisor with a command line, logging, a Prometheus exporter and Ctrl-C handling.
//! Workloads are registered by name against one backend and selected with `--workload`.
use crate::cli::{Cli, Command, MergeArgs, RunArgs};
use crate::error::RuntimeError;
use async_channel::Sender;
use clap::Parser;
use dbworkload::report::{merge_csv_windows, CsvReport};
use dbworkload::{Backend, RunError, Supervisor, Workload, WorkloadArgs, WorkloadFactory};
use dbworkload_core::{ConnInfo, RunConfig, RunSummary, DEFAULT_COMPRESSION};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::ExitCode;
#[allow(unused)]
use tracing::{debug, error, info, instrument, warn, Instrument};
use tracing_subscriber::EnvFilter;

/// Everything a registered workload needs to start a run.
pub struct Launch {
    pub config: RunConfig,
    pub conn_info: ConnInfo,
    pub args: WorkloadArgs,
    pub interrupts: async_channel::Receiver<()>,
}

type RunFuture = Pin<Box<dyn Future<Output = Result<RunSummary, RunError>> + Send>>;
type Launcher<B> = Box<dyn Fn(B, Launch) -> RunFuture + Send + Sync>;

/// Default dbworkload runtime.
///
/// # Example
///
/// ```ignore
/// use dbworkload_runtime::DbWorkloadRuntime;
///
/// #[tokio::main]
/// async fn main() -> std::process::ExitCode {
///     DbWorkloadRuntime::new(MyBackend::default())
///         .workload("bank", Arc::new(|args| Bank::new(args)))
///         .with_args()
///         .run()
///         .await
/// }
/// ```
pub struct DbWorkloadRuntime<B: Backend> {
    backend: B,
    workloads: BTreeMap<String, Launcher<B>>,
    cli: Option<Cli>,
}

impl<B: Backend> DbWorkloadRuntime<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            workloads: BTreeMap::new(),
            cli: None,
        }
    }

    /// Register a workload under `name`.
    pub fn workload<W>(mut self, name: &str, factory: WorkloadFactory<W>) -> Self
    where
        W: Workload<B::Conn>,
    {
        let launcher: Launcher<B> = Box::new(move |backend, launch| {
            Box::pin(
                Supervisor::new(backend, factory.clone())
                    .config(launch.config)
                    .conn_info(launch.conn_info)
                    .args(launch.args)
                    .interrupts(launch.interrupts)
                    .run(),
            )
        });
        self.workloads.insert(name.to_string(), launcher);
        self
    }

    /// Parse the process arguments.
    pub fn with_args(mut self) -> Self {
        self.cli = Some(Cli::parse());
        self
    }

    /// Parse the given arguments instead of the process ones.
    pub fn try_with_args_from<I, T>(mut self, args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        self.cli = Some(Cli::try_parse_from(args)?);
        Ok(self)
    }

    pub async fn run(self) -> ExitCode {
        let cli = match self.cli {
            Some(cli) => cli,
            None => Cli::parse(),
        };
        init_tracing(&cli.log_level);

        let res = match cli.command {
            Command::Run(args) => {
                launch(self.backend, &self.workloads, args)
                    .await
                    .map(|_| ())
            }
            Command::MergeCsvs(args) => merge(args).map(|_| ()),
        };

        match res {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{e}");
                ExitCode::FAILURE
            }
        }
    }

    /// Run a registered workload with already parsed arguments.
    pub async fn launch(self, args: RunArgs) -> Result<RunSummary, RuntimeError> {
        launch(self.backend, &self.workloads, args).await
    }
}

#[instrument(name = "dbworkload", skip_all, fields(workload = %args.workload))]
async fn launch<B: Backend>(
    backend: B,
    workloads: &BTreeMap<String, Launcher<B>>,
    args: RunArgs,
) -> Result<RunSummary, RuntimeError> {
    let launcher = workloads
        .get(&args.workload)
        .ok_or_else(|| RuntimeError::UnknownWorkload {
            name: args.workload.clone(),
            known: workloads.keys().cloned().collect::<Vec<_>>().join(", "),
        })?;

    if let Some(family) = args.family() {
        if family != backend.family() {
            warn!(
                "Connection string names {family}, the backend reports {}",
                backend.family()
            );
        }
    }

    let launch = Launch {
        config: args.run_config()?,
        conn_info: args.conn_info()?,
        args: args.workload_args()?,
        interrupts: forward_interrupts(),
    };

    if args.port != 0 {
        install_exporter(args.port);
    }

    Ok(launcher(backend, launch).await?)
}

/// Forward every Ctrl-C as one interrupt message.
fn forward_interrupts() -> async_channel::Receiver<()> {
    let (tx, rx) = async_channel::unbounded();
    tokio::spawn(interrupt_task(tx).in_current_span());
    rx
}

async fn interrupt_task(tx: Sender<()>) {
    while tokio::signal::ctrl_c().await.is_ok() {
        info!("Interrupt received");
        if tx.send(()).await.is_err() {
            break;
        }
    }
}

fn install_exporter(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => info!("Prometheus exporter listening on {addr}"),
        Err(e) => warn!("Could not start the Prometheus exporter on {addr}: {e}"),
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // A subscriber may already be installed, e.g. by a test harness.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Merge every CSV in the input directory, writing `<first>.merged.csv` next to them.
fn merge(args: MergeArgs) -> Result<PathBuf, RuntimeError> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(&args.input_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension().is_some_and(|ext| ext == "csv")
                && !p.to_string_lossy().ends_with(".merged.csv")
        })
        .collect();
    paths.sort();

    let Some(first) = paths.first() else {
        return Err(RuntimeError::NoCsvFiles(args.input_dir.display().to_string()));
    };
    let rows = merge_csv_windows(&paths, args.stats_frequency, DEFAULT_COMPRESSION)?;
    let output = first.with_extension("merged.csv");
    CsvReport::create(&output)?.append(&rows)?;
    info!(
        "Merged {} files into {} ({} rows)",
        paths.len(),
        output.display(),
        rows.len()
    );
    Ok(output)
}
