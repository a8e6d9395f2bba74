use std::num::NonZeroU64;
use std::time::Duration;

/// Measurement name for one full pass through a workload's transaction sequence.
pub const CYCLE: &str = "__cycle__";

/// Measurement name under which every retry attempt is recorded as a zero-duration sample.
pub const RETRIES: &str = "__retries__";

/// Default digest compression. Digests can only be merged with equal compression.
pub const DEFAULT_COMPRESSION: f64 = 1000.;

/// Default number of attempts the transaction executor makes before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base of the exponential backoff between retry attempts.
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Pause before reconnecting after a recoverable connection error.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Default report cadence.
pub const DEFAULT_STATS_FREQUENCY: NonZeroU64 = match NonZeroU64::new(10) {
    Some(v) => v,
    None => unreachable!(),
};

/// Delay after a window boundary before the supervisor aggregates, so in-flight
/// snapshots from every worker can arrive.
pub const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Lower and upper multiplier applied to the connection lifetime on every reconnect.
pub const CONN_DURATION_JITTER: (f64, f64) = (0.8, 1.2);
