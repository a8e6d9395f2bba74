//! One logical connection: connect, set up, run cycles, report.
use crate::timer::{unix_now, Cadence, FlushTimer};
use crate::transaction::{run_transaction, RetryPolicy, Setup, Step};
use crate::workload::{
    Backend, Connection, SetupContext, Transaction, Workload, WorkloadArgs, WorkloadFactory,
};
use async_channel::{Receiver, Sender, TryRecvError, TrySendError};
use dbworkload_core::{
    BackendFamily, ConnInfo, DbError, ErrorClass, Event, StatsBuffer, StatsReport, WorkerFailure,
    WorkerSpec, CONN_DURATION_JITTER, CYCLE,
};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// Everything a worker needs that does not change during a run.
pub(crate) struct Shared<B, W> {
    pub backend: B,
    pub conn_info: ConnInfo,
    pub factory: WorkloadFactory<W>,
    pub args: WorkloadArgs,
    pub settings: WorkerSettings,
    pub events: Sender<Event>,
}

#[derive(Debug, Clone)]
pub(crate) struct WorkerSettings {
    pub family: BackendFamily,
    pub retry: RetryPolicy,
    pub reconnect_delay: Duration,
    pub conn_duration: Option<Duration>,
    pub cadence: Option<Cadence>,
    pub compression: f64,
}

/// How a worker ended.
#[derive(Debug)]
enum Exit {
    Killed,
    Done,
    Fatal(WorkerFailure),
}

/// Entry point of a worker task. Never fails: every outcome becomes an [`Event`].
pub(crate) async fn run_worker<B, W>(
    shared: Arc<Shared<B, W>>,
    spec: WorkerSpec,
    kill: Receiver<()>,
) where
    B: Backend,
    W: Workload<B::Conn>,
{
    debug!("Thread ID {} started", spec.id);

    let mut workload = match (shared.factory)(&shared.args) {
        Ok(workload) => workload,
        Err(e) => {
            error!("Thread ID {} could not build its workload: {e}", spec.id);
            let failure = WorkerFailure::new(Some(spec.id), "ConfigError", e.to_string());
            let _ = shared.events.send(Event::Fatal(failure)).await;
            return;
        }
    };

    let mut worker = Worker {
        stats: StatsBuffer::new(shared.settings.compression),
        shared,
        spec,
        kill,
        cycles: 0,
        needs_setup: true,
    };

    let id = worker.spec.id;
    worker.send(Event::Init { worker: id }).await;

    let exit = worker.run(&mut workload).await;
    worker.finish(exit).await;
}

struct Worker<B, W> {
    shared: Arc<Shared<B, W>>,
    spec: WorkerSpec,
    kill: Receiver<()>,
    stats: StatsBuffer,
    cycles: u64,
    needs_setup: bool,
}

impl<B, W> Worker<B, W>
where
    B: Backend,
    W: Workload<B::Conn>,
{
    async fn run(&mut self, workload: &mut W) -> Exit {
        loop {
            if self.killed() {
                debug!("Poison pill received");
                return Exit::Killed;
            }

            let deadline = self
                .shared
                .settings
                .conn_duration
                .map(|d| Instant::now() + jittered(d));

            let mut conn = match self.shared.backend.connect(&self.shared.conn_info).await {
                Ok(conn) => conn,
                Err(e) => match self.recover(e).await {
                    Ok(true) => continue,
                    Ok(false) => return Exit::Killed,
                    Err(failure) => return Exit::Fatal(failure),
                },
            };
            debug!("Connection started");

            if self.needs_setup {
                self.needs_setup = false;
                if let Err(failure) = self.setup(&mut conn, workload).await {
                    conn.close().await;
                    return Exit::Fatal(failure);
                }
            }

            let res = self.run_connection(&mut conn, workload, deadline).await;
            conn.close().await;
            match res {
                Ok(Some(exit)) => return exit,
                Ok(None) => debug!("conn_duration reached, will reset the connection"),
                Err(e) => match self.recover(e).await {
                    Ok(true) => {}
                    Ok(false) => return Exit::Killed,
                    Err(failure) => return Exit::Fatal(failure),
                },
            }
        }
    }

    async fn setup(&mut self, conn: &mut B::Conn, workload: &mut W) -> Result<(), WorkerFailure> {
        debug!("Executing setup()");
        let settings = &self.shared.settings;
        let mut op = Setup {
            workload,
            ctx: SetupContext {
                worker_id: self.spec.id,
                concurrency: self.spec.concurrency,
            },
        };

        match run_transaction(conn, &mut op, settings.family, &settings.retry).await {
            Ok(outcome) if !outcome.committed() => {
                warn!("Thread ID {} setup() did not commit after retries", self.spec.id);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => Err(self.failure(&e, "SetupError")),
        }
    }

    /// Runs cycles on one connection. `Ok(None)` means the connection reached its lifetime.
    async fn run_connection(
        &mut self,
        conn: &mut B::Conn,
        workload: &mut W,
        deadline: Option<Instant>,
    ) -> Result<Option<Exit>, DbError> {
        let mut flush = self
            .shared
            .settings
            .cadence
            .map(|cadence| FlushTimer::new(cadence, unix_now()));

        loop {
            if self.killed() {
                debug!("Poison pill received");
                return Ok(Some(Exit::Killed));
            }

            if self.spec.iterations.is_some_and(|cap| self.cycles >= cap) {
                debug!("Task completed!");
                return Ok(Some(Exit::Done));
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(None);
            }

            self.cycle(conn, workload).await?;

            if let Some(timer) = flush.as_mut() {
                if timer.due(unix_now()) {
                    self.flush();
                }
            }
        }
    }

    async fn cycle(&mut self, conn: &mut B::Conn, workload: &mut W) -> Result<(), DbError> {
        let settings = &self.shared.settings;
        let cycle_start = Instant::now();

        for txn in workload.cycle() {
            let start = Instant::now();
            let mut op = Step {
                workload: &mut *workload,
                txn: &txn,
            };
            let outcome = run_transaction(conn, &mut op, settings.family, &settings.retry).await?;

            for _ in 0..outcome.retries() {
                self.stats.record_retry();
            }
            if outcome.committed() {
                self.stats.record(txn.name(), start.elapsed());
            }
        }

        self.cycles += 1;
        self.stats.record(CYCLE, cycle_start.elapsed());
        Ok(())
    }

    /// Decide whether an error outside the retry loop is survivable. `Ok(true)` means reconnect,
    /// `Ok(false)` means a kill arrived while waiting.
    async fn recover(&self, e: DbError) -> Result<bool, WorkerFailure> {
        let family = self.shared.settings.family;
        match family.classify(&e) {
            ErrorClass::MissingSchemaObject => Err(self.failure(&e, "MissingSchemaObject")),
            _ if family.reconnects() => {
                error!("error_type=DbError, msg={e}");
                let delay = self.shared.settings.reconnect_delay;
                info!("Sleeping for {}", humantime::format_duration(delay));
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(true),
                    _ = self.kill.recv() => {
                        debug!("Poison pill received");
                        Ok(false)
                    }
                }
            }
            _ => Err(self.failure(&e, "DbError")),
        }
    }

    fn failure(&self, e: &DbError, error_type: &str) -> WorkerFailure {
        error!("error_type={error_type}, msg={e}");
        WorkerFailure::new(Some(self.spec.id), error_type, e.to_string())
    }

    /// A closed kill channel means the proc is gone, which is as good as a kill.
    fn killed(&self) -> bool {
        match self.kill.try_recv() {
            Ok(()) | Err(TryRecvError::Closed) => true,
            Err(TryRecvError::Empty) => false,
        }
    }

    /// Periodic flush. Never blocks: if the inbound channel is full the window keeps accumulating
    /// and goes out with the next flush.
    fn flush(&mut self) {
        let report = StatsReport {
            worker: self.spec.id,
            stats: self.stats.snapshot(),
            last: false,
        };
        match self.shared.events.try_send(Event::Stats(report)) {
            Ok(()) => self.stats.new_window(),
            Err(TrySendError::Full(_)) => {
                error!("Inbound queue full, keeping stats for the next window")
            }
            Err(TrySendError::Closed(_)) => trace!("Inbound queue closed"),
        }
    }

    async fn finish(mut self, exit: Exit) {
        let id = self.spec.id;
        let event = match exit {
            Exit::Killed => Event::GotKilled { worker: id },
            Exit::Done => Event::TaskDone { worker: id },
            Exit::Fatal(failure) => Event::Fatal(failure),
        };
        self.send(event).await;

        let report = StatsReport {
            worker: id,
            stats: self.stats.flush(),
            last: true,
        };
        self.send(Event::Stats(report)).await;
        debug!("Thread ID {id} terminated");
    }

    async fn send(&self, event: Event) {
        if self.shared.events.send(event).await.is_err() {
            trace!("Inbound queue closed");
        }
    }
}

fn jittered(d: Duration) -> Duration {
    let (low, high) = CONN_DURATION_JITTER;
    d.mul_f64(rand::thread_rng().gen_range(low..high))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use dbworkload_core::RETRIES;

    async fn collect(events: &Receiver<Event>) -> Vec<Event> {
        let mut out = vec![];
        while let Ok(event) = events.recv().await {
            out.push(event);
        }
        out
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    #[ntest::timeout(5_000)]
    async fn stops_after_iteration_budget() {
        let (shared, events, counters) = shared(StubBackend::default(), Script::default());
        let (_kill_tx, kill_rx) = async_channel::unbounded();
        let spec = WorkerSpec {
            id: 7,
            iterations: Some(10 / 4),
            concurrency: 4,
        };

        run_worker(shared, spec, kill_rx).await;
        let events = collect(&events).await;

        assert!(matches!(events[0], Event::Init { worker: 7 }));
        assert!(matches!(events[1], Event::TaskDone { worker: 7 }));
        let Event::Stats(report) = &events[2] else {
            panic!("expected final stats, got {:?}", events[2]);
        };
        assert!(report.last);
        assert_eq!(report.stats.count(CYCLE), 2);
        assert_eq!(report.stats.count("txn"), 2);
        assert_eq!(events.len(), 3);
        assert_eq!(counters.cycles(), 2);
        assert_eq!(counters.setups(), 1);
    }

    #[tracing_test::traced_test]
    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_record_no_latency() {
        let script = Script {
            retryable_failures: u32::MAX,
            ..Script::default()
        };
        let (shared, events, _counters) = shared(StubBackend::default(), script);
        let (_kill_tx, kill_rx) = async_channel::unbounded();
        let spec = WorkerSpec {
            id: 1,
            iterations: Some(1),
            concurrency: 1,
        };

        run_worker(shared, spec, kill_rx).await;
        let events = collect(&events).await;

        let Some(Event::Stats(report)) = events.last() else {
            panic!("expected final stats");
        };
        assert_eq!(report.stats.count("txn"), 0);
        assert_eq!(report.stats.count(RETRIES), 3);
        assert_eq!(report.stats.count(CYCLE), 1);
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    #[ntest::timeout(5_000)]
    async fn kill_signal_stops_an_open_ended_worker() {
        let (shared, events, counters) = shared(StubBackend::default(), Script::default());
        let (kill_tx, kill_rx) = async_channel::unbounded();
        let spec = WorkerSpec {
            id: 3,
            iterations: None,
            concurrency: 1,
        };

        let handle = tokio::spawn(run_worker(shared, spec, kill_rx));
        while counters.cycles() < 5 {
            tokio::task::yield_now().await;
        }
        kill_tx.send(()).await.unwrap();
        handle.await.unwrap();

        let events = collect(&events).await;
        assert!(matches!(events[0], Event::Init { worker: 3 }));
        assert!(matches!(events[events.len() - 2], Event::GotKilled { worker: 3 }));
        assert!(logs_contain("Poison pill received"));
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    #[ntest::timeout(5_000)]
    async fn missing_table_is_fatal() {
        let script = Script {
            missing_table: true,
            ..Script::default()
        };
        let (shared, events, _counters) = shared(StubBackend::default(), script);
        let (_kill_tx, kill_rx) = async_channel::unbounded();
        let spec = WorkerSpec {
            id: 2,
            iterations: None,
            concurrency: 1,
        };

        run_worker(shared, spec, kill_rx).await;
        let events = collect(&events).await;

        let Event::Fatal(failure) = &events[1] else {
            panic!("expected a fatal event, got {:?}", events[1]);
        };
        assert_eq!(failure.worker, Some(2));
        assert_eq!(failure.error_type, "MissingSchemaObject");
    }

    #[tracing_test::traced_test]
    #[tokio::test(start_paused = true)]
    async fn connection_errors_are_retried_until_killed() {
        let backend = StubBackend {
            refuse_connections: true,
        };
        let (shared, events, _counters) = shared(backend, Script::default());
        let (kill_tx, kill_rx) = async_channel::unbounded();
        let spec = WorkerSpec {
            id: 4,
            iterations: None,
            concurrency: 1,
        };

        let handle = tokio::spawn(run_worker(shared, spec, kill_rx));
        tokio::time::sleep(Duration::from_secs(10)).await;
        kill_tx.send(()).await.unwrap();
        handle.await.unwrap();

        let events = collect(&events).await;
        assert!(matches!(events[1], Event::GotKilled { worker: 4 }));
        assert!(logs_contain("Sleeping for 3s"));
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    #[ntest::timeout(5_000)]
    async fn failing_factory_reports_without_init() {
        let (mut shared, events, _counters) = shared(StubBackend::default(), Script::default());
        Arc::get_mut(&mut shared).unwrap().factory =
            Arc::new(|_: &WorkloadArgs| -> Result<StubWorkload, dbworkload_core::ConfigError> {
                Err(dbworkload_core::ConfigError::Workload("bad mode".into()))
            });
        let (_kill_tx, kill_rx) = async_channel::unbounded();
        let spec = WorkerSpec {
            id: 5,
            iterations: None,
            concurrency: 1,
        };

        run_worker(shared, spec, kill_rx).await;
        let events = collect(&events).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::Fatal(f) if f.error_type == "ConfigError"));
    }
}
