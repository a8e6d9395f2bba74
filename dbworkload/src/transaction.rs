//! Bounded retry of a single transaction.
use crate::workload::{Connection, SetupContext, Transaction, Workload};
use dbworkload_core::{BackendFamily, DbError, ErrorClass};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// Something the executor can (re)try against a connection.
pub trait Attempt<C> {
    fn attempt(&mut self, conn: &mut C) -> impl Future<Output = Result<(), DbError>> + Send;
}

/// One transaction of a workload cycle.
pub struct Step<'a, W, T> {
    pub workload: &'a mut W,
    pub txn: &'a T,
}

impl<'a, C, W, T> Attempt<C> for Step<'a, W, T>
where
    C: Connection,
    W: Workload<C, Txn = T>,
    T: Transaction,
{
    fn attempt(&mut self, conn: &mut C) -> impl Future<Output = Result<(), DbError>> + Send {
        self.workload.execute(conn, self.txn)
    }
}

/// The workload's one-time setup hook.
pub struct Setup<'a, W> {
    pub workload: &'a mut W,
    pub ctx: SetupContext,
}

impl<'a, C, W> Attempt<C> for Setup<'a, W>
where
    C: Connection,
    W: Workload<C>,
{
    fn attempt(&mut self, conn: &mut C) -> impl Future<Output = Result<(), DbError>> + Send {
        self.workload.setup(conn, self.ctx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, first one included.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// `2^attempt * base_delay`, scaled by a jitter factor drawn from `[0.5, 1.5)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .mul_f64(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            dbworkload_core::DEFAULT_MAX_RETRIES,
            dbworkload_core::DEFAULT_RETRY_BASE_DELAY,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Committed after `retries` failed attempts.
    Committed { retries: u32 },
    /// Every attempt hit a retryable error. Not an error: the caller records the retries but
    /// no latency, and moves on to the next transaction.
    Exhausted { retries: u32 },
}

impl Outcome {
    pub fn retries(&self) -> u32 {
        match self {
            Outcome::Committed { retries } | Outcome::Exhausted { retries } => *retries,
        }
    }

    pub fn committed(&self) -> bool {
        matches!(self, Outcome::Committed { .. })
    }
}

/// Run `op`, rolling back and retrying retryable failures up to `policy.max_retries` attempts.
///
/// Non-retryable errors, and failures to roll back, are returned immediately.
pub async fn run_transaction<C, A>(
    conn: &mut C,
    op: &mut A,
    family: BackendFamily,
    policy: &RetryPolicy,
) -> Result<Outcome, DbError>
where
    C: Connection,
    A: Attempt<C>,
{
    for attempt in 1..=policy.max_retries {
        match op.attempt(conn).await {
            Ok(()) => {
                return Ok(Outcome::Committed {
                    retries: attempt - 1,
                })
            }
            Err(e) if family.classify(&e) == ErrorClass::Retryable => {
                debug!("Retryable error on attempt {attempt}: {e}");
                conn.rollback().await?;
                if attempt < policy.max_retries {
                    tokio::time::sleep(policy.backoff(attempt)).await;
                }
            }
            Err(e) => return Err(e),
        }
    }

    debug!(
        "Transaction did not succeed after {} retries",
        policy.max_retries
    );
    Ok(Outcome::Exhausted {
        retries: policy.max_retries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        rollbacks: u32,
        committed: u32,
    }

    impl Connection for Recorder {
        async fn rollback(&mut self) -> Result<(), DbError> {
            self.rollbacks += 1;
            Ok(())
        }
    }

    /// Fails with a serialization failure `failures` times, then commits.
    struct Flaky {
        failures: u32,
        calls: u32,
    }

    impl Attempt<Recorder> for Flaky {
        async fn attempt(&mut self, conn: &mut Recorder) -> Result<(), DbError> {
            self.calls += 1;
            if self.calls <= self.failures {
                Err(DbError::with_code("40001", "restart transaction"))
            } else {
                conn.committed += 1;
                Ok(())
            }
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn commits_after_two_retries() {
        let mut conn = Recorder::default();
        let mut op = Flaky {
            failures: 2,
            calls: 0,
        };

        let outcome = run_transaction(&mut conn, &mut op, BackendFamily::Postgres, &policy())
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Committed { retries: 2 });
        assert_eq!(conn.committed, 1);
        assert_eq!(conn.rollbacks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_attempts() {
        let mut conn = Recorder::default();
        let mut op = Flaky {
            failures: u32::MAX,
            calls: 0,
        };

        let outcome = run_transaction(&mut conn, &mut op, BackendFamily::Postgres, &policy())
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Exhausted { retries: 3 });
        assert_eq!(op.calls, 3);
        assert_eq!(conn.rollbacks, 3);
        assert_eq!(conn.committed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_propagate() {
        let mut conn = Recorder::default();
        let mut op = Flaky {
            failures: 1,
            calls: 0,
        };

        // Mongo never retries, so the serialization failure is returned as-is.
        let err = run_transaction(&mut conn, &mut op, BackendFamily::Mongo, &policy())
            .await
            .unwrap_err();

        assert_eq!(err.code.as_deref(), Some("40001"));
        assert_eq!(op.calls, 1);
        assert_eq!(conn.rollbacks, 0);
    }

    #[test]
    fn backoff_grows_exponentially_with_jitter() {
        let policy = policy();
        for attempt in 1..=3 {
            let base = Duration::from_millis(100) * 2u32.pow(attempt);
            let delay = policy.backoff(attempt);
            assert!(delay >= base.mul_f64(0.5) && delay <= base.mul_f64(1.5), "{delay:?}");
        }
    }
}
