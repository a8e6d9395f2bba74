use dbworkload::prelude::*;
use std::sync::{Arc, OnceLock};
use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[allow(unused)]
pub fn init() {
    static ONCE_LOCK: OnceLock<()> = OnceLock::new();

    ONCE_LOCK.get_or_init(|| {
        let default_panic = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            default_panic(info);
            error!("Panic occurred: {info:?}");
        }));

        let _ = FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("dbworkload=debug,mock_backend=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

#[allow(unused)]
pub fn bank_factory() -> WorkloadFactory<demos::Bank> {
    Arc::new(demos::Bank::new)
}

/// Quiet, no periodic reports, two procs.
#[allow(unused)]
pub fn config(concurrency: usize) -> RunConfig {
    RunConfig::new("bank")
        .concurrency(concurrency)
        .procs(2)
        .quiet(true)
        .stats_frequency(None)
}
