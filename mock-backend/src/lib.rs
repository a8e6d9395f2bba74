//! An in-memory key/value "database" implementing the dbworkload backend traits, with simulated
//! latency and injected failures.
use dbworkload::{Backend, Connection};
use dbworkload_core::{BackendFamily, ConnInfo, DbError};
#[allow(unused)]
use metrics::{counter, gauge, histogram};
use rand::Rng;
use rand_distr::{Distribution, LogNormal};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
#[allow(unused)]
use tracing::{debug, trace};

/// Behaviour of a [`MockBackend`].
#[derive(Debug, Clone)]
pub struct MockConfig {
    family: BackendFamily,
    latency: Option<LogNormal<f64>>,
    conflict_rate: f64,
    refuse_connections: bool,
    missing_tables: HashSet<String>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            family: BackendFamily::Postgres,
            latency: None,
            conflict_rate: 0.,
            refuse_connections: false,
            missing_tables: HashSet::new(),
        }
    }
}

impl MockConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Which family's error codes the mock speaks.
    pub fn family(mut self, family: BackendFamily) -> Self {
        self.family = family;
        self
    }

    /// Log-normal commit latency around `median`. `sigma` is the shape, 0.5 is a reasonable tail.
    pub fn latency(mut self, median: Duration, sigma: f64) -> Self {
        let mu = median.as_secs_f64().max(f64::MIN_POSITIVE).ln();
        self.latency = LogNormal::new(mu, sigma.max(0.)).ok();
        self
    }

    /// Probability that a commit fails with a serialization conflict.
    pub fn conflict_rate(mut self, rate: f64) -> Self {
        self.conflict_rate = rate.clamp(0., 1.);
        self
    }

    pub fn refuse_connections(mut self, refuse: bool) -> Self {
        self.refuse_connections = refuse;
        self
    }

    /// Any access to `table` fails as if it had never been created.
    pub fn missing_table(mut self, table: &str) -> Self {
        self.missing_tables.insert(table.to_string());
        self
    }
}

#[derive(Debug, Default)]
struct Store {
    tables: RwLock<BTreeMap<String, BTreeMap<String, i64>>>,
    commits: AtomicU64,
    conflicts: AtomicU64,
    rollbacks: AtomicU64,
    connections: AtomicU64,
}

/// Shared in-memory database. Cloning yields another handle to the same data.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    config: Arc<MockConfig>,
    store: Arc<Store>,
}

impl MockBackend {
    pub fn new(config: MockConfig) -> Self {
        Self {
            config: Arc::new(config),
            store: Arc::default(),
        }
    }

    pub fn commits(&self) -> u64 {
        self.store.commits.load(Ordering::Relaxed)
    }

    pub fn conflicts(&self) -> u64 {
        self.store.conflicts.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.store.rollbacks.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> u64 {
        self.store.connections.load(Ordering::Relaxed)
    }

    /// Committed value of `key` in `table`.
    pub fn value(&self, table: &str, key: &str) -> Option<i64> {
        let tables = self.store.tables.read().ok()?;
        tables.get(table)?.get(key).copied()
    }

    /// Number of committed keys in `table`.
    pub fn len(&self, table: &str) -> usize {
        self.store
            .tables
            .read()
            .map(|t| t.get(table).map(BTreeMap::len).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Sum of every committed value in `table`.
    pub fn sum(&self, table: &str) -> i64 {
        self.store
            .tables
            .read()
            .map(|t| t.get(table).map(|t| t.values().sum()).unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }
}

impl Backend for MockBackend {
    type Conn = MockConn;

    fn family(&self) -> BackendFamily {
        self.config.family
    }

    async fn connect(&self, info: &ConnInfo) -> Result<MockConn, DbError> {
        if self.config.refuse_connections {
            return Err(DbError::with_code(
                "08006",
                format!(
                    "connection refused: {}",
                    info.get("host").unwrap_or("localhost")
                ),
            ));
        }
        self.store.connections.fetch_add(1, Ordering::Relaxed);
        counter!("mock_backend.connections").increment(1);
        trace!("Connection opened");
        Ok(MockConn {
            config: self.config.clone(),
            store: self.store.clone(),
            pending: vec![],
        })
    }
}

#[derive(Debug, Clone)]
enum Write {
    Put(String, String, i64),
    Add(String, String, i64),
}

/// One connection with an open transaction buffer. Writes become visible on [`commit`].
///
/// [`commit`]: MockConn::commit
#[derive(Debug)]
pub struct MockConn {
    config: Arc<MockConfig>,
    store: Arc<Store>,
    pending: Vec<Write>,
}

impl MockConn {
    fn check_table(&self, table: &str) -> Result<(), DbError> {
        if !self.config.missing_tables.contains(table) {
            return Ok(());
        }
        Err(match self.config.family {
            BackendFamily::Postgres => {
                DbError::with_code("42P01", format!("relation \"{table}\" does not exist"))
            }
            BackendFamily::Mysql => {
                DbError::with_code("1146", format!("Table '{table}' doesn't exist"))
            }
            BackendFamily::Maria => DbError::new(format!("Table '{table}' doesn't exist")),
            BackendFamily::Oracle => {
                DbError::with_code("ORA-00942", "ORA-00942: table or view does not exist")
            }
            BackendFamily::Mongo | BackendFamily::Other => {
                DbError::new(format!("ns not found: {table}"))
            }
        })
    }

    fn conflict(&self) -> DbError {
        match self.config.family {
            BackendFamily::Postgres => DbError::with_code(
                "40001",
                "restart transaction: TransactionRetryWithProtoRefreshError",
            ),
            BackendFamily::Mysql | BackendFamily::Maria => DbError::with_code(
                "1213",
                "Deadlock found when trying to get lock; try restarting transaction",
            ),
            BackendFamily::Oracle => DbError::with_code(
                "ORA-08177",
                "ORA-08177: can't serialize access for this transaction",
            ),
            BackendFamily::Mongo | BackendFamily::Other => DbError::new("WriteConflict"),
        }
    }

    /// Read the committed value, ignoring this connection's pending writes.
    pub fn get(&self, table: &str, key: &str) -> Result<Option<i64>, DbError> {
        self.check_table(table)?;
        let tables = self
            .store
            .tables
            .read()
            .map_err(|_| DbError::new("store poisoned"))?;
        Ok(tables.get(table).and_then(|t| t.get(key)).copied())
    }

    pub fn put(&mut self, table: &str, key: &str, value: i64) -> Result<(), DbError> {
        self.check_table(table)?;
        self.pending
            .push(Write::Put(table.to_string(), key.to_string(), value));
        Ok(())
    }

    pub fn add(&mut self, table: &str, key: &str, delta: i64) -> Result<(), DbError> {
        self.check_table(table)?;
        self.pending
            .push(Write::Add(table.to_string(), key.to_string(), delta));
        Ok(())
    }

    /// Apply pending writes after the simulated latency, or fail with a conflict.
    pub async fn commit(&mut self) -> Result<(), DbError> {
        let (delay, conflict) = {
            let mut rng = rand::thread_rng();
            let delay = self
                .config
                .latency
                .as_ref()
                .map(|d| Duration::from_secs_f64(d.sample(&mut rng)));
            (delay, rng.gen_bool(self.config.conflict_rate))
        };

        match delay {
            Some(delay) => {
                histogram!("mock_backend.latency").record(delay.as_secs_f64());
                tokio::time::sleep(delay).await;
            }
            None => tokio::task::yield_now().await,
        }

        if conflict {
            self.store.conflicts.fetch_add(1, Ordering::Relaxed);
            counter!("mock_backend.conflicts").increment(1);
            return Err(self.conflict());
        }

        let mut tables = self
            .store
            .tables
            .write()
            .map_err(|_| DbError::new("store poisoned"))?;
        for write in self.pending.drain(..) {
            match write {
                Write::Put(table, key, value) => {
                    tables.entry(table).or_default().insert(key, value);
                }
                Write::Add(table, key, delta) => {
                    *tables.entry(table).or_default().entry(key).or_default() += delta;
                }
            }
        }
        self.store.commits.fetch_add(1, Ordering::Relaxed);
        counter!("mock_backend.commits").increment(1);
        Ok(())
    }
}

impl Connection for MockConn {
    async fn rollback(&mut self) -> Result<(), DbError> {
        self.pending.clear();
        self.store.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(self) {
        trace!("Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_are_visible_after_commit() {
        let db = MockBackend::default();
        let mut conn = db.connect(&ConnInfo::new()).await.unwrap();

        conn.put("accounts", "a", 100).unwrap();
        conn.add("accounts", "a", -30).unwrap();
        assert_eq!(conn.get("accounts", "a").unwrap(), None);

        conn.commit().await.unwrap();
        assert_eq!(db.value("accounts", "a"), Some(70));
        assert_eq!(db.commits(), 1);
        assert_eq!(db.len("accounts"), 1);
        assert_eq!(db.sum("accounts"), 70);
    }

    #[tokio::test]
    async fn rollback_discards_pending_writes() {
        let db = MockBackend::default();
        let mut conn = db.connect(&ConnInfo::new()).await.unwrap();

        conn.put("accounts", "a", 1).unwrap();
        conn.rollback().await.unwrap();
        conn.commit().await.unwrap();
        assert!(db.is_empty("accounts"));
        assert_eq!(db.rollbacks(), 1);
    }

    #[tokio::test]
    async fn injected_errors_classify_per_family() {
        for family in [
            BackendFamily::Postgres,
            BackendFamily::Mysql,
            BackendFamily::Maria,
            BackendFamily::Oracle,
        ] {
            let db = MockBackend::new(
                MockConfig::new()
                    .family(family)
                    .conflict_rate(1.)
                    .missing_table("orders"),
            );
            let mut conn = db.connect(&ConnInfo::new()).await.unwrap();

            let err = conn.put("orders", "o", 1).unwrap_err();
            assert_eq!(
                family.classify(&err),
                dbworkload_core::ErrorClass::MissingSchemaObject,
                "{family}"
            );

            let err = conn.commit().await.unwrap_err();
            assert_eq!(
                family.classify(&err),
                dbworkload_core::ErrorClass::Retryable,
                "{family}"
            );
        }
    }

    #[tokio::test]
    async fn refused_connections_are_fatal_but_reconnectable() {
        let db = MockBackend::new(MockConfig::new().refuse_connections(true));
        let err = db.connect(&ConnInfo::new()).await.unwrap_err();
        assert_eq!(db.family().classify(&err), dbworkload_core::ErrorClass::Fatal);
        assert!(db.family().reconnects());
        assert_eq!(db.connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn commits_wait_for_simulated_latency() {
        let db = MockBackend::new(MockConfig::new().latency(Duration::from_millis(20), 0.));
        let mut conn = db.connect(&ConnInfo::new()).await.unwrap();

        let start = tokio::time::Instant::now();
        conn.commit().await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(19), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(21), "{elapsed:?}");
    }
}
