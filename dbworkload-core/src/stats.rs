use crate::{ConfigError, Digest, WorkerStats};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Latency quantiles in milliseconds, rounded to two decimals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl LatencySummary {
    /// Digests hold seconds. An empty digest summarizes to all zeros.
    pub fn from_digest(digest: &Digest) -> Self {
        let ms = |v: Option<f64>| round2(v.unwrap_or(0.) * 1000.);
        Self {
            mean_ms: ms(digest.mean()),
            p50_ms: ms(digest.quantile(0.50)),
            p90_ms: ms(digest.quantile(0.90)),
            p95_ms: ms(digest.quantile(0.95)),
            p99_ms: ms(digest.quantile(0.99)),
            max_ms: ms(digest.max()),
        }
    }
}

/// One measurement in one reporting window. Field order is the CSV column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub ts: u64,
    pub elapsed: u64,
    pub id: String,
    pub threads: usize,
    pub tot_ops: u64,
    pub tot_ops_s: f64,
    pub period_ops: u64,
    pub period_ops_s: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
    pub centroids: String,
}

impl ReportRow {
    pub fn latency(&self) -> LatencySummary {
        LatencySummary {
            mean_ms: self.mean_ms,
            p50_ms: self.p50_ms,
            p90_ms: self.p90_ms,
            p95_ms: self.p95_ms,
            p99_ms: self.p99_ms,
            max_ms: self.max_ms,
        }
    }
}

/// One measurement over the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalRow {
    pub elapsed: u64,
    pub id: String,
    pub threads: usize,
    pub tot_ops: u64,
    pub tot_ops_s: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

/// What a finished run hands back to its caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_name: String,
    /// Unix seconds.
    pub start: u64,
    /// Unix seconds.
    pub end: u64,
    /// Whether the run was cut short by an interrupt.
    pub interrupted: bool,
    pub final_stats: Vec<FinalRow>,
}

impl RunSummary {
    pub fn measurement(&self, id: &str) -> Option<&FinalRow> {
        self.final_stats.iter().find(|row| row.id == id)
    }

    pub fn duration_secs(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }
}

#[derive(Debug, Clone)]
struct Aggregate {
    window: Digest,
    run: Digest,
    total_ops: u64,
    period_ops: u64,
}

impl Aggregate {
    fn new(compression: f64) -> Self {
        Self {
            window: Digest::new(compression),
            run: Digest::new(compression),
            total_ops: 0,
            period_ops: 0,
        }
    }
}

/// Supervisor-side accumulator: per measurement, the open window and the whole run.
///
/// Snapshots are attributed to whichever window is open when they are added.
#[derive(Debug, Clone)]
pub struct AggregatedStats {
    compression: f64,
    start: u64,
    window_start: u64,
    rows: BTreeMap<String, Aggregate>,
}

impl AggregatedStats {
    /// `start` is the run start in Unix seconds.
    pub fn new(start: u64, compression: f64) -> Self {
        Self {
            compression,
            start,
            window_start: start,
            rows: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, stats: &WorkerStats) -> Result<(), ConfigError> {
        for (_, digest) in stats.iter() {
            if digest.compression() != self.compression {
                return Err(ConfigError::CompressionMismatch {
                    left: self.compression,
                    right: digest.compression(),
                });
            }
        }

        for (name, digest) in stats.iter() {
            let compression = self.compression;
            let row = self
                .rows
                .entry(name.to_owned())
                .or_insert_with(|| Aggregate::new(compression));
            row.window.merge(digest)?;
            row.run.merge(digest)?;
            let ops = digest.count().round() as u64;
            row.total_ops += ops;
            row.period_ops += ops;
        }
        Ok(())
    }

    /// Rows for the window `[window_start, end)`.
    pub fn report(&self, threads: usize, end: u64) -> Vec<ReportRow> {
        let elapsed = end.saturating_sub(self.start);
        let period = end.saturating_sub(self.window_start).max(1);
        self.rows
            .iter()
            .map(|(id, row)| {
                let latency = LatencySummary::from_digest(&row.window);
                ReportRow {
                    ts: end,
                    elapsed,
                    id: id.clone(),
                    threads,
                    tot_ops: row.total_ops,
                    tot_ops_s: per_second(row.total_ops, elapsed),
                    period_ops: row.period_ops,
                    period_ops_s: per_second(row.period_ops, period),
                    mean_ms: latency.mean_ms,
                    p50_ms: latency.p50_ms,
                    p90_ms: latency.p90_ms,
                    p95_ms: latency.p95_ms,
                    p99_ms: latency.p99_ms,
                    max_ms: latency.max_ms,
                    centroids: row.window.to_centroid_blob(),
                }
            })
            .collect()
    }

    /// Close the open window at `end` and start the next one. Totals carry over.
    pub fn new_window(&mut self, end: u64) {
        for row in self.rows.values_mut() {
            row.window = row.window.cleared();
            row.period_ops = 0;
        }
        self.window_start = end;
    }

    /// Whole-run rows, independent of window boundaries.
    pub fn final_report(&self, threads: usize, end: u64) -> Vec<FinalRow> {
        let elapsed = end.saturating_sub(self.start);
        self.rows
            .iter()
            .map(|(id, row)| {
                let latency = LatencySummary::from_digest(&row.run);
                FinalRow {
                    elapsed,
                    id: id.clone(),
                    threads,
                    tot_ops: row.total_ops,
                    tot_ops_s: per_second(row.total_ops, elapsed),
                    mean_ms: latency.mean_ms,
                    p50_ms: latency.p50_ms,
                    p90_ms: latency.p90_ms,
                    p95_ms: latency.p95_ms,
                    p99_ms: latency.p99_ms,
                    max_ms: latency.max_ms,
                }
            })
            .collect()
    }

    pub fn total_ops(&self, id: &str) -> u64 {
        self.rows.get(id).map(|row| row.total_ops).unwrap_or(0)
    }
}

fn per_second(ops: u64, secs: u64) -> f64 {
    if secs == 0 {
        return ops as f64;
    }
    round2(ops as f64 / secs as f64)
}

pub(crate) fn round2(v: f64) -> f64 {
    (v * 100.).round() / 100.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StatsBuffer, CYCLE};
    use std::time::Duration;

    fn snapshot(name: &str, millis: &[u64]) -> WorkerStats {
        let mut buffer = StatsBuffer::new(100.);
        for ms in millis {
            buffer.record(name, Duration::from_millis(*ms));
        }
        buffer.snapshot()
    }

    #[test]
    fn windows_reset_but_totals_accumulate() {
        let mut stats = AggregatedStats::new(1_000, 100.);
        stats.add(&snapshot("txn", &[10, 20])).unwrap();
        stats.add(&snapshot("txn", &[30, 40])).unwrap();

        let rows = stats.report(2, 1_010);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.elapsed, 10);
        assert_eq!(row.threads, 2);
        assert_eq!(row.tot_ops, 4);
        assert_eq!(row.period_ops, 4);
        assert_eq!(row.period_ops_s, 0.4);
        assert_eq!(row.mean_ms, 25.);
        assert_eq!(row.max_ms, 40.);
        assert!(!row.centroids.is_empty());

        stats.new_window(1_010);
        stats.add(&snapshot("txn", &[5])).unwrap();
        let row = stats.report(2, 1_015).remove(0);
        assert_eq!(row.tot_ops, 5);
        assert_eq!(row.period_ops, 1);
        assert_eq!(row.period_ops_s, 0.2);
        assert_eq!(row.max_ms, 5.);

        let last = stats.final_report(2, 1_020).remove(0);
        assert_eq!(last.tot_ops, 5);
        assert_eq!(last.tot_ops_s, 0.25);
        assert_eq!(last.max_ms, 40.);
    }

    #[test]
    fn quiet_measurements_stay_listed() {
        let mut buffer = StatsBuffer::new(100.);
        buffer.record(CYCLE, Duration::from_millis(3));
        let mut stats = AggregatedStats::new(0, 100.);
        stats.add(&buffer.flush()).unwrap();
        stats.new_window(10);
        stats.add(&buffer.flush()).unwrap();

        let row = stats.report(1, 20).remove(0);
        assert_eq!(row.id, CYCLE);
        assert_eq!(row.period_ops, 0);
        assert_eq!(row.mean_ms, 0.);
        assert_eq!(row.centroids, "");
    }

    #[test]
    fn foreign_compression_is_rejected_before_merging() {
        let mut stats = AggregatedStats::new(0, 1000.);
        assert!(stats.add(&snapshot("txn", &[1])).is_err());
        assert_eq!(stats.total_ops("txn"), 0);
    }
}
