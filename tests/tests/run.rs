mod utils;
#[allow(unused)]
use utils::*;

use dbworkload::prelude::*;
use dbworkload::report::read_csv;
use dbworkload_core::{CYCLE, RETRIES};
use demos::ACCOUNTS;
use mock_backend::{MockBackend, MockConfig, MockConn};
use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
#[ntest::timeout(30_000)]
async fn iteration_budget_runs_every_cycle_once() -> anyhow::Result<()> {
    init();
    let db = MockBackend::new(MockConfig::new().conflict_rate(0.2));
    let args = WorkloadArgs::new().set("accounts", 50).set("read_pct", 0);

    let summary = Supervisor::new(db.clone(), bank_factory())
        .config(config(4).iterations(40))
        .args(args)
        .run()
        .await?;

    assert!(!summary.interrupted);
    assert_eq!(summary.measurement(CYCLE).map(|r| r.tot_ops), Some(40));
    // Conflicts are rolled back, so money is neither created nor destroyed.
    assert_eq!(db.sum(ACCOUNTS), 50 * 1000);
    if db.conflicts() > 0 {
        assert!(summary.measurement(RETRIES).is_some());
    }
    Ok(())
}

#[tokio::test]
#[ntest::timeout(30_000)]
async fn interrupt_accounts_for_every_commit() -> anyhow::Result<()> {
    init();
    let db = MockBackend::new(MockConfig::new().latency(Duration::from_micros(200), 0.3));
    let (tx, rx) = async_channel_pair();

    let run = tokio::spawn(
        Supervisor::new(db.clone(), bank_factory())
            .config(config(6))
            .interrupts(rx)
            .run(),
    );
    tokio::time::sleep(Duration::from_millis(500)).await;
    tx.send(()).await?;
    let summary = run.await??;

    assert!(summary.interrupted);
    let ops = |id| summary.measurement(id).map(|r| r.tot_ops).unwrap_or(0);
    // One setup commit per worker, every other commit is a measured transaction.
    assert_eq!(ops("read") + ops("transfer") + 6, db.commits());
    assert_eq!(ops(CYCLE), ops("read") + ops("transfer"));
    Ok(())
}

#[tokio::test]
#[ntest::timeout(30_000)]
async fn schedule_phases_are_reported_and_saved() -> anyhow::Result<()> {
    init();
    let dir = tempfile::tempdir()?;
    let db = MockBackend::new(MockConfig::new().latency(Duration::from_millis(1), 0.2));
    let schedule = Schedule::new(vec![
        Phase::new(2, Duration::ZERO, Some(Duration::from_secs(2))),
        Phase::new(4, Duration::from_secs(1), Some(Duration::from_secs(2))),
    ])?;

    let summary = Supervisor::new(db.clone(), bank_factory())
        .config(
            config(1)
                .schedule(schedule)
                .stats_frequency(NonZeroU64::new(1))
                .save(true)
                .output_dir(dir.path()),
        )
        .run()
        .await?;

    assert!(summary.run_name.starts_with("bank."));
    assert!(summary.duration_secs() >= 3);
    let cycle = summary.measurement(CYCLE).expect("cycles were recorded");
    assert_eq!(cycle.threads, 4);

    let rows = read_csv(&dir.path().join(format!("{}.csv", summary.run_name)))?;
    assert!(rows.iter().any(|r| r.id == CYCLE));
    // Window totals add up to the whole-run total.
    let windowed: u64 = rows
        .iter()
        .filter(|r| r.id == CYCLE)
        .map(|r| r.period_ops)
        .sum();
    assert_eq!(windowed, cycle.tot_ops);

    let txt = std::fs::read_to_string(dir.path().join(format!("{}.txt", summary.run_name)))?;
    assert!(txt.contains("run_name"));
    assert!(txt.contains("tot_ops/s"));
    Ok(())
}

#[tokio::test]
#[ntest::timeout(30_000)]
async fn missing_table_aborts_the_run() {
    init();
    let db = MockBackend::new(
        MockConfig::new()
            .family(BackendFamily::Mysql)
            .missing_table(ACCOUNTS),
    );

    let err = Supervisor::new(db, bank_factory())
        .config(config(2))
        .run()
        .await
        .unwrap_err();

    let RunError::Worker(failure) = err else {
        panic!("expected a worker failure, got {err:?}");
    };
    assert_eq!(failure.error_type, "SetupError");
    assert!(failure.message.contains("doesn't exist"));
}

#[tokio::test]
#[ntest::timeout(30_000)]
async fn unreachable_database_waits_until_interrupted() -> anyhow::Result<()> {
    init();
    let db = MockBackend::new(MockConfig::new().refuse_connections(true));
    let (tx, rx) = async_channel_pair();

    let run = tokio::spawn(
        Supervisor::new(db.clone(), bank_factory())
            .config(config(2).reconnect_delay(Duration::from_millis(50)))
            .interrupts(rx)
            .run(),
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    tx.send(()).await?;
    let summary = run.await??;

    assert!(summary.interrupted);
    assert!(summary.final_stats.is_empty());
    assert_eq!(db.connections(), 0);
    Ok(())
}

#[tokio::test]
#[ntest::timeout(30_000)]
async fn families_without_reconnect_fail_on_connection_errors() {
    init();
    let db = MockBackend::new(
        MockConfig::new()
            .family(BackendFamily::Mongo)
            .refuse_connections(true),
    );

    let err = Supervisor::new(db, bank_factory())
        .config(config(1))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::Worker(f) if f.error_type == "DbError"));
}

#[tokio::test]
async fn bad_workload_arguments_fail_fast() {
    init();
    let db = MockBackend::default();

    let err = Supervisor::new(db.clone(), bank_factory())
        .config(config(2))
        .args(WorkloadArgs::new().set("read_pct", 150))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::Config(ConfigError::Workload(_))));
    assert_eq!(db.connections(), 0);
}

#[tokio::test]
#[ntest::timeout(30_000)]
async fn connection_lifetime_resets_without_losing_stats() -> anyhow::Result<()> {
    init();
    let db = MockBackend::new(MockConfig::new().latency(Duration::from_millis(1), 0.2));

    let summary = Supervisor::new(db.clone(), bank_factory())
        .config(
            config(1)
                .procs(1)
                .duration(Duration::from_secs(3))
                .conn_duration(Duration::from_millis(500)),
        )
        .run()
        .await?;

    // Lifetimes are jittered by at most 20%, so three seconds hold at least four resets.
    assert!(db.connections() >= 5, "{} connections", db.connections());
    let ops = |id| summary.measurement(id).map(|r| r.tot_ops).unwrap_or(0);
    assert_eq!(ops(CYCLE), ops("read") + ops("transfer"));
    // Setup ran on the first connection only.
    assert_eq!(ops(CYCLE) + 1, db.commits());
    Ok(())
}

/// Never finishes a transaction, so its worker never sees the kill.
struct Stall;

#[derive(Debug, Clone, Copy)]
struct StallTxn;

impl Transaction for StallTxn {
    fn name(&self) -> &str {
        "stall"
    }
}

impl Workload<MockConn> for Stall {
    type Txn = StallTxn;

    fn cycle(&mut self) -> Vec<StallTxn> {
        vec![StallTxn]
    }

    async fn execute(&mut self, _conn: &mut MockConn, _txn: &StallTxn) -> Result<(), DbError> {
        std::future::pending().await
    }
}

#[tokio::test]
#[ntest::timeout(30_000)]
async fn stalled_worker_times_out_the_drain() {
    init();
    let factory: WorkloadFactory<Stall> =
        Arc::new(|_: &WorkloadArgs| -> Result<Stall, ConfigError> { Ok(Stall) });

    let err = Supervisor::new(MockBackend::default(), factory)
        .config(config(1).procs(1).duration(Duration::from_secs(1)))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::DrainTimeout(1)), "{err:?}");
}

fn async_channel_pair() -> (async_channel::Sender<()>, async_channel::Receiver<()>) {
    async_channel::unbounded()
}
