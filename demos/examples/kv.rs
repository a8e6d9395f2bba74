//! `cargo run -p demos --example kv -- run -w bank -c 8 -r 10 -d 60 -a '{"read_pct": 80}'`
use demos::Bank;
use dbworkload_runtime::DbWorkloadRuntime;
use mock_backend::{MockBackend, MockConfig};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> ExitCode {
    let backend = MockBackend::new(
        MockConfig::new()
            .latency(Duration::from_millis(2), 0.5)
            .conflict_rate(0.01),
    );

    DbWorkloadRuntime::new(backend)
        .workload::<Bank>("bank", Arc::new(Bank::new))
        .with_args()
        .run()
        .await
}
