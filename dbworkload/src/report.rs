//! Report rendering and persistence: periodic tables, the CSV window log, the final summary and
//! offline re-aggregation of saved CSVs.
use crate::error::ReportError;
use dbworkload_core::{Digest, FinalRow, LatencySummary, ReportRow};
use num_format::{Locale, ToFormattedString};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use tabled::settings::Style;
use tabled::{builder::Builder, Table, Tabled};
use time::macros::format_description;
use time::OffsetDateTime;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// Column order of the window CSV. Matches the field order of [`ReportRow`].
pub const CSV_HEADERS: [&str; 15] = [
    "ts",
    "elapsed",
    "id",
    "threads",
    "tot_ops",
    "tot_ops_s",
    "period_ops",
    "period_ops_s",
    "mean_ms",
    "p50_ms",
    "p90_ms",
    "p95_ms",
    "p99_ms",
    "max_ms",
    "centroids",
];

/// `<workload>.<YYYYMMDD_HHMMSS>` in UTC.
pub fn run_name(workload: &str, start: u64) -> Result<String, ReportError> {
    let start = OffsetDateTime::from_unix_timestamp(start as i64)?;
    let stamp = start.format(format_description!(
        "[year][month][day]_[hour][minute][second]"
    ))?;
    Ok(format!("{workload}.{stamp}"))
}

fn timestamp(ts: u64) -> Result<String, ReportError> {
    let ts = OffsetDateTime::from_unix_timestamp(ts as i64)?;
    Ok(ts.format(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    ))?)
}

fn int<T: ToFormattedString>(v: &T) -> String {
    v.to_formatted_string(&Locale::en)
}

/// Two decimals, thousands grouped in the whole part.
fn float(v: &f64) -> String {
    let fixed = format!("{:.2}", v.abs());
    let (whole, frac) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let sign = if *v < 0. && fixed != "0.00" { "-" } else { "" };
    match whole.parse::<u64>() {
        Ok(whole) => format!("{sign}{}.{frac}", int(&whole)),
        Err(_) => format!("{v:.2}"),
    }
}

#[derive(Tabled)]
struct WindowLine<'a> {
    #[tabled(display_with = "int")]
    elapsed: u64,
    id: &'a str,
    #[tabled(display_with = "int")]
    threads: usize,
    #[tabled(display_with = "int")]
    tot_ops: u64,
    #[tabled(rename = "tot_ops/s", display_with = "float")]
    tot_ops_s: f64,
    #[tabled(display_with = "int")]
    period_ops: u64,
    #[tabled(rename = "period_ops/s", display_with = "float")]
    period_ops_s: f64,
    #[tabled(rename = "mean(ms)", display_with = "float")]
    mean_ms: f64,
    #[tabled(rename = "p50(ms)", display_with = "float")]
    p50_ms: f64,
    #[tabled(rename = "p90(ms)", display_with = "float")]
    p90_ms: f64,
    #[tabled(rename = "p95(ms)", display_with = "float")]
    p95_ms: f64,
    #[tabled(rename = "p99(ms)", display_with = "float")]
    p99_ms: f64,
    #[tabled(rename = "max(ms)", display_with = "float")]
    max_ms: f64,
}

impl<'a> From<&'a ReportRow> for WindowLine<'a> {
    fn from(row: &'a ReportRow) -> Self {
        Self {
            elapsed: row.elapsed,
            id: &row.id,
            threads: row.threads,
            tot_ops: row.tot_ops,
            tot_ops_s: row.tot_ops_s,
            period_ops: row.period_ops,
            period_ops_s: row.period_ops_s,
            mean_ms: row.mean_ms,
            p50_ms: row.p50_ms,
            p90_ms: row.p90_ms,
            p95_ms: row.p95_ms,
            p99_ms: row.p99_ms,
            max_ms: row.max_ms,
        }
    }
}

#[derive(Tabled)]
struct FinalLine<'a> {
    #[tabled(display_with = "int")]
    elapsed: u64,
    id: &'a str,
    #[tabled(display_with = "int")]
    threads: usize,
    #[tabled(display_with = "int")]
    tot_ops: u64,
    #[tabled(rename = "tot_ops/s", display_with = "float")]
    tot_ops_s: f64,
    #[tabled(rename = "mean(ms)", display_with = "float")]
    mean_ms: f64,
    #[tabled(rename = "p50(ms)", display_with = "float")]
    p50_ms: f64,
    #[tabled(rename = "p90(ms)", display_with = "float")]
    p90_ms: f64,
    #[tabled(rename = "p95(ms)", display_with = "float")]
    p95_ms: f64,
    #[tabled(rename = "p99(ms)", display_with = "float")]
    p99_ms: f64,
    #[tabled(rename = "max(ms)", display_with = "float")]
    max_ms: f64,
}

impl<'a> From<&'a FinalRow> for FinalLine<'a> {
    fn from(row: &'a FinalRow) -> Self {
        Self {
            elapsed: row.elapsed,
            id: &row.id,
            threads: row.threads,
            tot_ops: row.tot_ops,
            tot_ops_s: row.tot_ops_s,
            mean_ms: row.mean_ms,
            p50_ms: row.p50_ms,
            p90_ms: row.p90_ms,
            p95_ms: row.p95_ms,
            p99_ms: row.p99_ms,
            max_ms: row.max_ms,
        }
    }
}

#[derive(Tabled)]
struct ParamLine<'a> {
    #[tabled(rename = "Parameter")]
    name: &'a str,
    #[tabled(rename = "Value")]
    value: &'a str,
}

pub fn render_window(rows: &[ReportRow]) -> String {
    Table::new(rows.iter().map(WindowLine::from))
        .with(Style::psql())
        .to_string()
}

pub fn render_final(rows: &[FinalRow]) -> String {
    Table::new(rows.iter().map(FinalLine::from))
        .with(Style::sharp())
        .to_string()
}

pub fn render_details(run_name: &str, start: u64, end: u64) -> Result<String, ReportError> {
    let mut builder = Builder::default();
    builder.push_record(["run_name".to_string(), run_name.to_string()]);
    builder.push_record(["start_time".to_string(), timestamp(start)?]);
    builder.push_record(["end_time".to_string(), timestamp(end)?]);
    builder.push_record([
        "test_duration".to_string(),
        end.saturating_sub(start).to_string(),
    ]);
    Ok(builder.build().with(Style::blank()).to_string())
}

pub fn render_parameters(params: &[(String, String)]) -> String {
    Table::new(params.iter().map(|(name, value)| ParamLine { name, value }))
        .with(Style::blank())
        .to_string()
}

/// Run details, whole-run statistics and runtime parameters, separated by blank lines.
pub fn render_summary(
    run_name: &str,
    start: u64,
    end: u64,
    rows: &[FinalRow],
    params: &[(String, String)],
) -> Result<String, ReportError> {
    Ok(format!(
        "{}\n\n{}\n\n{}\n",
        render_details(run_name, start, end)?,
        render_final(rows),
        render_parameters(params)
    ))
}

/// Append-only CSV log of report windows.
#[derive(Debug, Clone)]
pub struct CsvReport {
    path: PathBuf,
}

impl CsvReport {
    /// Create (or truncate) the file and write the header row.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, ReportError> {
        let path = path.into();
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(File::create(&path)?);
        writer.write_record(CSV_HEADERS)?;
        writer.flush()?;
        Ok(Self { path })
    }

    pub fn append(&self, rows: &[ReportRow]) -> Result<(), ReportError> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub fn read_csv(path: &Path) -> Result<Vec<ReportRow>, ReportError> {
    let mut reader = csv::Reader::from_path(path)?;
    let rows = reader.deserialize().collect::<Result<Vec<ReportRow>, _>>()?;
    Ok(rows)
}

/// Re-aggregate windows from several saved runs, e.g. one CSV per client machine.
///
/// Rows are bucketed by `ts` into `frequency`-second windows relative to the earliest row; per
/// bucket and measurement, digests are merged and thread counts summed. Totals are recomputed
/// from the merged digests.
pub fn merge_csv_windows(
    paths: &[PathBuf],
    frequency: NonZeroU64,
    compression: f64,
) -> Result<Vec<ReportRow>, ReportError> {
    let mut rows = vec![];
    for path in paths {
        rows.extend(read_csv(path)?);
    }
    let Some(min_ts) = rows.iter().map(|r| r.ts).min() else {
        return Ok(vec![]);
    };

    let f = frequency.get();
    let bucket = |ts: u64| {
        let x = ts - min_ts;
        (if x % f == 0 { x } else { x + f - x % f }) + f
    };

    struct Bucket {
        ts: u64,
        threads: usize,
        digest: Digest,
    }

    let mut buckets: BTreeMap<(u64, String), Bucket> = BTreeMap::new();
    for row in rows {
        let digest = Digest::from_centroid_blob(compression, &row.centroids)?;
        let key = (bucket(row.ts), row.id);
        match buckets.get_mut(&key) {
            Some(b) => {
                b.ts = b.ts.min(row.ts);
                b.threads += row.threads;
                b.digest.merge(&digest)?;
            }
            None => {
                buckets.insert(
                    key,
                    Bucket {
                        ts: row.ts,
                        threads: row.threads,
                        digest,
                    },
                );
            }
        }
    }

    let mut totals: BTreeMap<String, u64> = BTreeMap::new();
    let merged = buckets
        .into_iter()
        .map(|((elapsed, id), b)| {
            let period_ops = b.digest.count().round() as u64;
            let tot_ops = {
                let total = totals.entry(id.clone()).or_default();
                *total += period_ops;
                *total
            };
            let latency = LatencySummary::from_digest(&b.digest);
            ReportRow {
                ts: b.ts,
                elapsed,
                id,
                threads: b.threads,
                tot_ops,
                tot_ops_s: (tot_ops / elapsed) as f64,
                period_ops,
                period_ops_s: (period_ops / f) as f64,
                mean_ms: latency.mean_ms,
                p50_ms: latency.p50_ms,
                p90_ms: latency.p90_ms,
                p95_ms: latency.p95_ms,
                p99_ms: latency.p99_ms,
                max_ms: latency.max_ms,
                centroids: b.digest.to_centroid_blob(),
            }
        })
        .collect();
    Ok(merged)
}

/// Publish a window through the `metrics` facade, one gauge per column and measurement.
#[cfg(feature = "metrics")]
pub fn publish(rows: &[ReportRow]) {
    for row in rows {
        let gauges = [
            ("dbworkload_threads", row.threads as f64),
            ("dbworkload_tot_ops", row.tot_ops as f64),
            ("dbworkload_tot_ops_s", row.tot_ops_s),
            ("dbworkload_period_ops", row.period_ops as f64),
            ("dbworkload_period_ops_s", row.period_ops_s),
            ("dbworkload_mean_ms", row.mean_ms),
            ("dbworkload_p50_ms", row.p50_ms),
            ("dbworkload_p90_ms", row.p90_ms),
            ("dbworkload_p95_ms", row.p95_ms),
            ("dbworkload_p99_ms", row.p99_ms),
            ("dbworkload_max_ms", row.max_ms),
        ];
        for (name, value) in gauges {
            metrics::gauge!(name, "id" => row.id.clone()).set(value);
        }
    }
}

#[cfg(not(feature = "metrics"))]
pub fn publish(_rows: &[ReportRow]) {}

/// Where a run's reports go: stdout tables, the CSV log and metrics.
#[derive(Debug)]
pub(crate) struct Reporter {
    run_name: String,
    quiet: bool,
    output_dir: PathBuf,
    csv: Option<CsvReport>,
}

impl Reporter {
    pub fn new(
        run_name: &str,
        quiet: bool,
        save: bool,
        output_dir: &Path,
    ) -> Result<Self, ReportError> {
        let csv = if save {
            std::fs::create_dir_all(output_dir)?;
            let path = output_dir.join(format!("{run_name}.csv"));
            info!("Saving stats to {}", path.display());
            Some(CsvReport::create(path)?)
        } else {
            None
        };

        Ok(Self {
            run_name: run_name.to_string(),
            quiet,
            output_dir: output_dir.to_path_buf(),
            csv,
        })
    }

    pub fn window(&self, rows: &[ReportRow]) -> Result<(), ReportError> {
        if let Some(csv) = &self.csv {
            csv.append(rows)?;
        }
        if !self.quiet {
            println!("{}\n", render_window(rows));
        }
        publish(rows);
        Ok(())
    }

    pub fn summary(
        &self,
        start: u64,
        end: u64,
        rows: &[FinalRow],
        params: &[(String, String)],
    ) -> Result<(), ReportError> {
        let summary = render_summary(&self.run_name, start, end, rows, params)?;
        if self.csv.is_some() {
            let path = self.output_dir.join(format!("{}.txt", self.run_name));
            let mut file = File::create(&path)?;
            file.write_all(summary.as_bytes())?;
            info!("Saved summary to {}", path.display());
        }
        println!("\n{summary}");
        Ok(())
    }
}
