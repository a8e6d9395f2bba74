use crate::{Digest, RETRIES};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Per-worker accumulation buffer: one digest per measurement name, reset every window.
///
/// Latencies are recorded in seconds.
#[derive(Debug, Clone)]
pub struct StatsBuffer {
    compression: f64,
    digests: BTreeMap<String, Digest>,
}

impl StatsBuffer {
    pub fn new(compression: f64) -> Self {
        Self {
            compression,
            digests: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, name: &str, latency: Duration) {
        self.digest_mut(name).insert(latency.as_secs_f64());
    }

    /// One zero-valued sample under [`RETRIES`]; only the count is meaningful.
    pub fn record_retry(&mut self) {
        self.digest_mut(RETRIES).insert(0.);
    }

    /// Copy of the current window.
    pub fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            measurements: self
                .digests
                .iter()
                .map(|(name, digest)| {
                    let mut digest = digest.clone();
                    digest.compress();
                    (name.clone(), digest)
                })
                .collect(),
        }
    }

    /// Clear every digest. Names seen so far are kept, so later snapshots still report them.
    pub fn new_window(&mut self) {
        for digest in self.digests.values_mut() {
            *digest = digest.cleared();
        }
    }

    /// [`Self::snapshot`] followed by [`Self::new_window`], without the copy.
    pub fn flush(&mut self) -> WorkerStats {
        let compression = self.compression;
        let measurements = self
            .digests
            .iter_mut()
            .map(|(name, digest)| {
                let mut taken = std::mem::replace(digest, Digest::new(compression));
                taken.compress();
                (name.clone(), taken)
            })
            .collect();
        WorkerStats { measurements }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.digests.keys().map(String::as_str)
    }

    fn digest_mut(&mut self, name: &str) -> &mut Digest {
        let compression = self.compression;
        self.digests
            .entry(name.to_owned())
            .or_insert_with(|| Digest::new(compression))
    }
}

/// A serializable snapshot of a [`StatsBuffer`] window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerStats {
    measurements: BTreeMap<String, Digest>,
}

impl WorkerStats {
    pub fn get(&self, name: &str) -> Option<&Digest> {
        self.measurements.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Digest)> {
        self.measurements.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Sample count recorded under `name` in this window, zero if never seen.
    pub fn count(&self, name: &str) -> u64 {
        self.get(name).map(|d| d.count().round() as u64).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }
}
