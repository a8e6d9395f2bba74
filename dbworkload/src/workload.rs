//! Traits a database backend and a workload implement to be driven by the engine.
use dbworkload_core::{BackendFamily, ConfigError, ConnInfo, DbError};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;

/// Opens connections. One instance is shared by every worker of a run.
pub trait Backend: Send + Sync + 'static {
    type Conn: Connection;

    /// Decides retry and abort behaviour for errors this backend produces.
    fn family(&self) -> BackendFamily;

    fn connect(
        &self,
        info: &ConnInfo,
    ) -> impl Future<Output = Result<Self::Conn, DbError>> + Send;
}

/// A live connection, exclusively owned by one worker.
pub trait Connection: Send + 'static {
    fn rollback(&mut self) -> impl Future<Output = Result<(), DbError>> + Send;

    fn close(self) -> impl Future<Output = ()> + Send
    where
        Self: Sized,
    {
        async {}
    }
}

/// A named unit of work yielded by [`Workload::cycle`].
pub trait Transaction: Send + Sync {
    /// Measurement name latencies are recorded under.
    fn name(&self) -> &str;
}

impl Transaction for &'static str {
    fn name(&self) -> &str {
        self
    }
}

impl Transaction for String {
    fn name(&self) -> &str {
        self.as_str()
    }
}

/// Identity of the worker running [`Workload::setup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupContext {
    pub worker_id: usize,
    pub concurrency: usize,
}

/// A workload, instantiated once per worker.
///
/// ```no_run
/// use dbworkload::prelude::*;
///
/// struct Ping;
///
/// impl<C: Connection> Workload<C> for Ping {
///     type Txn = &'static str;
///
///     fn cycle(&mut self) -> Vec<Self::Txn> {
///         vec!["ping"]
///     }
///
///     async fn execute(&mut self, _conn: &mut C, _txn: &Self::Txn) -> Result<(), DbError> {
///         Ok(())
///     }
/// }
/// ```
pub trait Workload<C: Connection>: Send + 'static {
    type Txn: Transaction;

    /// Runs once per worker, after its first successful connection.
    fn setup(
        &mut self,
        _conn: &mut C,
        _ctx: SetupContext,
    ) -> impl Future<Output = Result<(), DbError>> + Send {
        async { Ok(()) }
    }

    /// Transactions making up one cycle, in order. Asked again before every cycle.
    fn cycle(&mut self) -> Vec<Self::Txn>;

    /// Run one transaction. Errors go through retry classification.
    fn execute(
        &mut self,
        conn: &mut C,
        txn: &Self::Txn,
    ) -> impl Future<Output = Result<(), DbError>> + Send;
}

/// Builds a workload from its arguments. Called once up front to fail fast, then once per worker.
pub type WorkloadFactory<W> = Arc<dyn Fn(&WorkloadArgs) -> Result<W, ConfigError> + Send + Sync>;

/// Free-form workload arguments, typically loaded from JSON.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkloadArgs(Map<String, Value>);

impl WorkloadArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::default()),
            other => Err(ConfigError::Workload(format!(
                "expected a JSON object, found {other}"
            ))),
        }
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Deserialize a key into `T`, `None` when absent.
    pub fn parse<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.get(key)
            .map(|v| {
                serde_json::from_value(v.clone())
                    .map_err(|e| ConfigError::Workload(format!("{key}: {e}")))
            })
            .transpose()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for WorkloadArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Value::Object(self.0.clone()))
    }
}
