mod utils;
#[allow(unused)]
use utils::*;

use clap::Parser;
use dbworkload_core::CYCLE;
use dbworkload_runtime::{Cli, Command, DbWorkloadRuntime, RunArgs, RuntimeError};
use demos::{Bank, ACCOUNTS};
use mock_backend::MockBackend;

fn run_args(args: &[&str]) -> RunArgs {
    let base = ["dbworkload", "run", "-p", "0", "-q", "-s", "0"];
    let cli = Cli::try_parse_from(base.iter().chain(args)).unwrap();
    match cli.command {
        Command::Run(args) => args,
        other => panic!("unexpected command {other:?}"),
    }
}

fn runtime(db: &MockBackend) -> DbWorkloadRuntime<MockBackend> {
    DbWorkloadRuntime::new(db.clone()).workload("bank", bank_factory())
}

#[tokio::test]
#[ntest::timeout(30_000)]
async fn command_line_drives_a_run() -> anyhow::Result<()> {
    init();
    let db = MockBackend::default();
    let args = run_args(&[
        "-w",
        "bank",
        "-u",
        "postgres://root@localhost:26257/bank",
        "-c",
        "3",
        "-x",
        "1",
        "-i",
        "30",
        "-a",
        r#"{"accounts": 20, "initial_balance": 50}"#,
    ]);

    let summary = runtime(&db).launch(args).await?;

    assert!(summary.run_name.starts_with("bank."));
    assert_eq!(summary.measurement(CYCLE).map(|r| r.tot_ops), Some(30));
    assert_eq!(db.len(ACCOUNTS), 20);
    assert_eq!(db.sum(ACCOUNTS), 20 * 50);
    Ok(())
}

#[tokio::test]
async fn unknown_workloads_are_rejected() {
    init();
    let db = MockBackend::default();

    let err = runtime(&db)
        .launch(run_args(&["-w", "ledger", "-i", "1"]))
        .await
        .unwrap_err();

    let RuntimeError::UnknownWorkload { name, known } = err else {
        panic!("expected an unknown workload error, got {err:?}");
    };
    assert_eq!(name, "ledger");
    assert_eq!(known, "bank");
    assert_eq!(db.connections(), 0);
}

#[tokio::test]
async fn malformed_workload_arguments_are_rejected() {
    init();
    let db = MockBackend::default();

    let err = runtime(&db)
        .launch(run_args(&["-w", "bank", "-a", "{accounts: 3"]))
        .await
        .unwrap_err();

    assert!(matches!(err, RuntimeError::Args(..)));
}

#[test]
fn merge_command_parses() {
    let _ = DbWorkloadRuntime::new(MockBackend::default())
        .workload::<Bank>("bank", std::sync::Arc::new(Bank::new))
        .try_with_args_from(["dbworkload", "merge-csvs", "--input-dir", "."])
        .unwrap();
}
