//! Run orchestration: procs, the phase schedule, periodic aggregation and shutdown.
use crate::error::RunError;
use crate::proc::{spawn_proc, ProcHandle};
use crate::ramp::RampScheduler;
use crate::report::{run_name, Reporter};
use crate::timer::{unix_now, Cadence};
use crate::transaction::RetryPolicy;
use crate::worker::{Shared, WorkerSettings};
use crate::workload::{Backend, Workload, WorkloadArgs, WorkloadFactory};
use async_channel::Receiver;
use dbworkload_core::{
    AggregatedStats, ConnInfo, ControlMessage, Event, RunConfig, RunPlan, RunSummary,
    WorkerFailure, SETTLE_DELAY,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
#[allow(unused)]
use tracing::{debug, error, info, instrument, trace, warn};

/// Capacity of the inbound event channel shared by every worker.
const INBOUND_CAPACITY: usize = 65536;
/// Upper bound on how long the main loop waits for an event before checking its timers.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long a poison pill may wait for mailbox space.
const PILL_TIMEOUT: Duration = Duration::from_millis(100);
/// How long shutdown waits for each outstanding stats message.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Drives one run of a workload against a backend.
///
/// ```no_run
/// # use dbworkload::prelude::*;
/// # use std::sync::Arc;
/// # async fn run<B: Backend, W: Workload<B::Conn>>(backend: B, factory: WorkloadFactory<W>) {
/// let summary = Supervisor::new(backend, factory)
///     .config(RunConfig::new("bank").concurrency(8).iterations(10_000))
///     .run()
///     .await;
/// # }
/// ```
pub struct Supervisor<B, W> {
    backend: B,
    factory: WorkloadFactory<W>,
    conn_info: ConnInfo,
    args: WorkloadArgs,
    config: RunConfig,
    interrupts: Option<Receiver<()>>,
}

impl<B, W> Supervisor<B, W>
where
    B: Backend,
    W: Workload<B::Conn>,
{
    pub fn new(backend: B, factory: WorkloadFactory<W>) -> Self {
        Self {
            backend,
            factory,
            conn_info: ConnInfo::new(),
            args: WorkloadArgs::new(),
            config: RunConfig::new(workload_name::<W>()),
            interrupts: None,
        }
    }

    pub fn config(mut self, config: RunConfig) -> Self {
        self.config = config;
        self
    }

    pub fn conn_info(mut self, conn_info: ConnInfo) -> Self {
        self.conn_info = conn_info;
        self
    }

    pub fn args(mut self, args: WorkloadArgs) -> Self {
        self.args = args;
        self
    }

    /// Each message is one user interrupt, and every one of them pills every proc. An interrupt
    /// that finds a mailbox still full from an earlier one forces an exit.
    pub fn interrupts(mut self, interrupts: Receiver<()>) -> Self {
        self.interrupts = Some(interrupts);
        self
    }

    pub async fn run(self) -> Result<RunSummary, RunError> {
        let plan = self.config.plan()?;
        // Fails fast on bad workload arguments, before any worker exists.
        (self.factory)(&self.args)?;

        let start = unix_now();
        let name = run_name(&self.config.workload, start)?;
        self.execute(plan, start, name).await
    }

    #[instrument(name = "run", skip_all, fields(run = %name))]
    async fn execute(
        self,
        plan: RunPlan,
        start: u64,
        name: String,
    ) -> Result<RunSummary, RunError> {
        let config = &self.config;
        let reporter = Reporter::new(&name, config.quiet, config.save, &config.output_dir)?;
        info!("Starting run {name}");

        let (events_tx, inbound) = async_channel::bounded(INBOUND_CAPACITY);
        let cadence = config.stats_frequency.map(|f| Cadence::new(f, start));
        let family = self.backend.family();
        debug!("Backend family: {family}");
        let shared = Arc::new(Shared {
            backend: self.backend,
            conn_info: self.conn_info.clone(),
            factory: self.factory,
            args: self.args.clone(),
            settings: WorkerSettings {
                family,
                retry: RetryPolicy::new(config.max_retries, config.retry_base_delay),
                reconnect_delay: config.reconnect_delay,
                conn_duration: config.conn_duration,
                cadence,
                compression: config.compression,
            },
            events: events_tx,
        });

        let mut procs = Vec::with_capacity(config.procs);
        for id in 0..config.procs {
            match spawn_proc(id, shared.clone()) {
                Ok(proc) => procs.push(proc),
                Err(e) => {
                    abort(procs);
                    return Err(e);
                }
            }
        }
        drop(shared);
        debug!("Started {} procs", procs.len());

        let mut run = Run {
            procs,
            inbound,
            interrupts: self.interrupts,
            interrupted: false,
            stats: AggregatedStats::new(start, config.compression),
            tracker: Tracker::default(),
            reporter,
            start,
            expected_inits: 0,
            report_time: config
                .stats_frequency
                .map(|f| start + f.get() + SETTLE_DELAY.as_secs()),
            frequency: config.stats_frequency.map(|f| f.get()),
        };

        let threads = match run.phases(&plan).await {
            Ok(Ending::Completed) => run.shutdown(false).await,
            Ok(Ending::ProcsReturned) => run.shutdown(true).await,
            Err(e) => {
                abort(run.procs);
                return Err(e);
            }
        }?;

        let end = unix_now();
        let final_stats = run.stats.final_report(threads, end);
        let params = runtime_params(config, &self.conn_info, &self.args);
        run.reporter.summary(start, end, &final_stats, &params)?;

        Ok(RunSummary {
            run_name: name,
            start,
            end,
            interrupted: run.interrupted,
            final_stats,
        })
    }
}

/// Why the phase loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    /// Schedule exhausted, or every active worker finished its iterations.
    Completed,
    /// Every proc is gone, after an interrupt.
    ProcsReturned,
}

/// Lifecycle bookkeeping from the inbound channel.
#[derive(Debug, Default)]
struct Tracker {
    /// Workers that sent `Init` and were not killed.
    active: usize,
    /// `Init` count over the whole run.
    inits: usize,
    /// `TaskDone` count for the current phase.
    returned_threads: usize,
    returned_procs: usize,
    /// Workers that sent `Init` but not yet their last stats.
    pending: HashSet<usize>,
}

impl Tracker {
    fn handle(&mut self, event: Event, stats: &mut AggregatedStats) -> Result<(), RunError> {
        trace!("Received {event:?}");
        match event {
            Event::Init { worker } => {
                self.active += 1;
                self.inits += 1;
                self.pending.insert(worker);
            }
            Event::GotKilled { .. } => self.active = self.active.saturating_sub(1),
            Event::TaskDone { .. } => self.returned_threads += 1,
            Event::ProcReturned { proc_id } => {
                debug!("PROC-{proc_id} returned");
                self.returned_procs += 1;
            }
            Event::Stats(report) => {
                stats.add(&report.stats)?;
                if report.last {
                    self.pending.remove(&report.worker);
                }
            }
            Event::Fatal(failure) => {
                error!(
                    "error_type={}, msg={}",
                    failure.error_type, failure.message
                );
                return Err(RunError::Worker(failure));
            }
        }
        Ok(())
    }
}

enum RampState {
    Idle(RampScheduler),
    Running(JoinHandle<RampScheduler>),
}

impl RampState {
    async fn into_scheduler(self) -> Result<RampScheduler, RunError> {
        match self {
            RampState::Idle(scheduler) => Ok(scheduler),
            RampState::Running(handle) => handle.await.map_err(|e| {
                RunError::Worker(WorkerFailure::new(None, "Panic", e.to_string()))
            }),
        }
    }
}

struct Run {
    procs: Vec<ProcHandle>,
    inbound: Receiver<Event>,
    interrupts: Option<Receiver<()>>,
    interrupted: bool,
    stats: AggregatedStats,
    tracker: Tracker,
    reporter: Reporter,
    start: u64,
    /// Workers the ramps have spawned up to and including the current phase.
    expected_inits: usize,
    report_time: Option<u64>,
    frequency: Option<u64>,
}

impl Run {
    async fn phases(&mut self, plan: &RunPlan) -> Result<Ending, RunError> {
        let mailboxes = self.procs.iter().map(|p| p.mailbox.clone()).collect();
        let mut ramp = RampState::Idle(RampScheduler::new(
            mailboxes,
            plan.iterations_per_worker,
            plan.peak_concurrency(),
        ));
        let mut current = 0;
        let phases = plan.schedule.len();

        for (i, phase) in plan.schedule.iter().enumerate() {
            debug!(
                "Starting schedule {}/{phases}: cc = {}, ramp = {}, dur = {}",
                i + 1,
                phase.concurrency,
                humantime::format_duration(phase.ramp),
                phase
                    .duration
                    .map(|d| humantime::format_duration(d).to_string())
                    .unwrap_or_else(|| "unbounded".to_string()),
            );

            self.expected_inits += phase.concurrency.saturating_sub(current);
            let scheduler = ramp.into_scheduler().await?;
            let handle = tokio::spawn(scheduler.ramp(current, phase.concurrency, phase.ramp));
            ramp = RampState::Running(handle);
            current = phase.concurrency;
            self.tracker.returned_threads = 0;

            let phase_end = phase.duration.map(|d| Instant::now() + d);
            let ending = self.phase(phase_end).await;
            if !matches!(ending, Ok(None)) {
                if let RampState::Running(handle) = &ramp {
                    handle.abort();
                }
            }
            match ending? {
                Some(ending) => return Ok(ending),
                None => continue,
            }
        }

        if let RampState::Running(handle) = ramp {
            handle.abort();
        }
        Ok(Ending::Completed)
    }

    /// Runs until the phase deadline (`Ok(None)`) or until the whole run is over.
    async fn phase(&mut self, phase_end: Option<Instant>) -> Result<Option<Ending>, RunError> {
        loop {
            if phase_end.is_some_and(|end| Instant::now() >= end) {
                return Ok(None);
            }

            tokio::select! {
                event = self.inbound.recv() => {
                    let event = event.map_err(|_| RunError::ChannelClosed)?;
                    self.tracker.handle(event, &mut self.stats)?;
                }
                _ = next_interrupt(&self.interrupts) => self.interrupt().await?,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            let tracker = &self.tracker;
            if tracker.returned_procs >= self.procs.len() {
                debug!("All procs returned");
                return Ok(Some(Ending::ProcsReturned));
            }
            // Completion only counts once every worker of the phase has started, so a fast worker
            // cannot end the run while the ramp is still spawning.
            if tracker.inits >= self.expected_inits
                && tracker.returned_threads > 0
                && tracker.returned_threads >= tracker.active
            {
                info!("Requested iteration/duration limit reached");
                return Ok(Some(Ending::Completed));
            }

            self.periodic_report()?;
        }
    }

    fn periodic_report(&mut self) -> Result<(), RunError> {
        let (Some(report_time), Some(frequency)) = (self.report_time, self.frequency) else {
            return Ok(());
        };
        let now = unix_now();
        if now < report_time {
            return Ok(());
        }

        // The window closes at the boundary, not after the settle delay.
        let end = now.saturating_sub(SETTLE_DELAY.as_secs()).max(self.start);
        let rows = self.stats.report(self.tracker.active, end);
        self.stats.new_window(end);
        self.reporter.window(&rows)?;
        self.report_time = Some(report_time + frequency);
        Ok(())
    }

    /// Every interrupt pills every proc. A mailbox still full from an earlier interrupt means
    /// the procs are not keeping up, so the run is forced to exit.
    async fn interrupt(&mut self) -> Result<(), RunError> {
        let again = std::mem::replace(&mut self.interrupted, true);
        if again {
            warn!("Interrupted again, resending poison pills");
        } else {
            info!("Interrupt received, stopping all procs");
        }
        match self.send_pills().await {
            Err(RunError::MailboxFull(id)) if again => {
                error!("PROC-{id} still holds an earlier pill, forcing exit");
                Err(RunError::ForcedExit)
            }
            res => res,
        }
    }

    async fn send_pills(&self) -> Result<(), RunError> {
        for proc in &self.procs {
            match timeout(PILL_TIMEOUT, proc.mailbox.send(ControlMessage::Terminate)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => trace!("PROC-{} mailbox already closed", proc.id),
                Err(_) => {
                    error!("Timed out delivering poison pill to PROC-{}", proc.id);
                    return Err(RunError::MailboxFull(proc.id));
                }
            }
        }
        Ok(())
    }

    /// Stops every proc, collects the last stats of every initialized worker and emits the
    /// closing window. Returns the thread count at the moment the run stopped.
    async fn shutdown(&mut self, pills_sent: bool) -> Result<usize, RunError> {
        let end = unix_now();
        let threads = self.tracker.active;

        if !pills_sent {
            if let Err(e) = self.send_pills().await {
                abort(std::mem::take(&mut self.procs));
                return Err(e);
            }
        }

        // Join on a detached thread and keep consuming events meanwhile, so no worker blocks
        // on a full inbound channel while its proc is being joined. A proc stuck on a worker
        // that never reports is left behind once the drain times out.
        let procs = std::mem::take(&mut self.procs);
        let (joined_tx, joined) = async_channel::bounded::<()>(1);
        std::thread::Builder::new()
            .name("proc-joiner".into())
            .spawn(move || {
                for proc in procs {
                    proc.join();
                }
                let _ = joined_tx.send_blocking(());
            })
            .map_err(RunError::ProcSpawn)?;
        let mut inbound_open = true;
        loop {
            tokio::select! {
                _ = joined.recv() => break,
                event = timeout(DRAIN_TIMEOUT, self.inbound.recv()), if inbound_open => {
                    match event {
                        Ok(Ok(event)) => self.tracker.handle(event, &mut self.stats)?,
                        Ok(Err(_)) => inbound_open = false,
                        Err(_) if !self.tracker.pending.is_empty() => {
                            error!("Timed out waiting for procs to stop, quitting");
                            return Err(RunError::DrainTimeout(self.tracker.pending.len()));
                        }
                        Err(_) => {}
                    }
                }
            }
        }
        debug!("All procs joined");

        while !self.tracker.pending.is_empty() {
            match timeout(DRAIN_TIMEOUT, self.inbound.recv()).await {
                Ok(Ok(event)) => self.tracker.handle(event, &mut self.stats)?,
                Ok(Err(_)) => {
                    warn!(
                        "Inbound channel closed with {} worker(s) unaccounted for",
                        self.tracker.pending.len()
                    );
                    break;
                }
                Err(_) => {
                    error!("Timed out, quitting");
                    return Err(RunError::DrainTimeout(self.tracker.pending.len()));
                }
            }
        }

        let rows = self.stats.report(threads, end);
        if !rows.is_empty() {
            info!("Printing final stats");
        }
        self.reporter.window(&rows)?;
        Ok(threads)
    }
}

/// Type name of the workload without its module path.
fn workload_name<W>() -> &'static str {
    let name = std::any::type_name::<W>();
    name.rsplit("::").next().unwrap_or(name)
}

async fn next_interrupt(interrupts: &Option<Receiver<()>>) {
    match interrupts {
        Some(rx) if rx.recv().await.is_ok() => {}
        _ => std::future::pending().await,
    }
}

/// Fatal path: pill every proc without waiting and leave the threads to wind down.
fn abort(procs: Vec<ProcHandle>) {
    for proc in procs {
        let _ = proc.mailbox.try_send(ControlMessage::Terminate);
    }
}

fn runtime_params(
    config: &RunConfig,
    conn_info: &ConnInfo,
    args: &WorkloadArgs,
) -> Vec<(String, String)> {
    let optional = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
    let map = |m: &std::collections::BTreeMap<String, String>| {
        serde_json::to_string(m).unwrap_or_default()
    };
    vec![
        ("workload".into(), config.workload.clone()),
        ("conn_params".into(), map(&conn_info.params)),
        ("conn_extras".into(), map(&conn_info.extras)),
        ("concurrency".into(), config.concurrency.to_string()),
        (
            "duration".into(),
            optional(
                config
                    .duration
                    .map(|d| humantime::format_duration(d).to_string()),
            ),
        ),
        (
            "iterations".into(),
            optional(config.iterations.map(|i| i.to_string())),
        ),
        (
            "ramp".into(),
            humantime::format_duration(config.ramp).to_string(),
        ),
        ("args".into(), args.to_string()),
    ]
}
