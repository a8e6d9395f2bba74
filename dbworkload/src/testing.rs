//! In-crate stand-ins for a database and a workload.
use crate::transaction::RetryPolicy;
use crate::worker::{Shared, WorkerSettings};
use crate::workload::{Backend, Connection, SetupContext, Workload, WorkloadArgs, WorkloadFactory};
use async_channel::Receiver;
use dbworkload_core::{BackendFamily, ConfigError, ConnInfo, DbError, Event};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub(crate) struct StubBackend {
    pub refuse_connections: bool,
}

pub(crate) struct StubConn;

impl Connection for StubConn {
    async fn rollback(&mut self) -> Result<(), DbError> {
        Ok(())
    }
}

impl Backend for StubBackend {
    type Conn = StubConn;

    fn family(&self) -> BackendFamily {
        BackendFamily::Postgres
    }

    async fn connect(&self, _info: &ConnInfo) -> Result<StubConn, DbError> {
        if self.refuse_connections {
            Err(DbError::with_code("08006", "connection refused"))
        } else {
            Ok(StubConn)
        }
    }
}

/// How the stub workload misbehaves.
#[derive(Debug, Clone, Default)]
pub(crate) struct Script {
    pub retryable_failures: u32,
    pub missing_table: bool,
}

/// Counters shared by every stub workload instance of a test.
#[derive(Debug, Clone, Default)]
pub(crate) struct Counters {
    cycles: Arc<AtomicU64>,
    setups: Arc<AtomicU64>,
}

impl Counters {
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn setups(&self) -> u64 {
        self.setups.load(Ordering::Relaxed)
    }
}

pub(crate) struct StubWorkload {
    script: Script,
    counters: Counters,
}

impl Workload<StubConn> for StubWorkload {
    type Txn = &'static str;

    async fn setup(&mut self, _conn: &mut StubConn, _ctx: SetupContext) -> Result<(), DbError> {
        self.counters.setups.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn cycle(&mut self) -> Vec<&'static str> {
        self.counters.cycles.fetch_add(1, Ordering::Relaxed);
        vec!["txn"]
    }

    async fn execute(&mut self, _conn: &mut StubConn, _txn: &&'static str) -> Result<(), DbError> {
        tokio::task::yield_now().await;
        if self.script.missing_table {
            return Err(DbError::with_code("42P01", "relation \"txn\" does not exist"));
        }
        if self.script.retryable_failures > 0 {
            self.script.retryable_failures -= 1;
            return Err(DbError::with_code("40001", "restart transaction"));
        }
        Ok(())
    }
}

pub(crate) fn settings() -> WorkerSettings {
    WorkerSettings {
        family: BackendFamily::Postgres,
        retry: RetryPolicy::new(3, Duration::from_millis(100)),
        reconnect_delay: Duration::from_secs(3),
        conn_duration: None,
        cadence: None,
        compression: 100.,
    }
}

pub(crate) fn factory(script: Script, counters: &Counters) -> WorkloadFactory<StubWorkload> {
    let counters = counters.clone();
    Arc::new(move |_: &WorkloadArgs| -> Result<StubWorkload, ConfigError> {
        Ok(StubWorkload {
            script: script.clone(),
            counters: counters.clone(),
        })
    })
}

pub(crate) fn shared(
    backend: StubBackend,
    script: Script,
) -> (Arc<Shared<StubBackend, StubWorkload>>, Receiver<Event>, Counters) {
    let (tx, rx) = async_channel::bounded(1024);
    let counters = Counters::default();
    let shared = Shared {
        backend,
        conn_info: ConnInfo::new(),
        factory: factory(script, &counters),
        args: WorkloadArgs::new(),
        settings: settings(),
        events: tx,
    };
    (Arc::new(shared), rx, counters)
}
