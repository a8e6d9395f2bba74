//! Mergeable quantile digest over [`tdigest::TDigest`].
//!
//! Samples are buffered and folded in batches, since every fold rebuilds the centroid list.
use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt::Write;
use tdigest::{Centroid, TDigest};

/// Samples held back before they are folded into the centroids.
const BUFFER_LEN: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "SerializedDigest", try_from = "SerializedDigest")]
pub struct Digest {
    compression: f64,
    inner: TDigest,
    buffer: Vec<f64>,
}

impl Digest {
    pub fn new(compression: f64) -> Self {
        Self {
            compression,
            inner: TDigest::new_with_size(max_size(compression)),
            buffer: vec![],
        }
    }

    fn try_new(compression: f64) -> Result<Self, ConfigError> {
        if compression.is_finite() && compression >= 1. {
            Ok(Self::new(compression))
        } else {
            Err(ConfigError::InvalidCompression(compression))
        }
    }

    /// Rebuild from exported `(mean, weight)` pairs and the exact extremes, when known.
    fn from_parts(
        compression: f64,
        mut centroids: Vec<(f64, f64)>,
        extremes: Option<(f64, f64)>,
    ) -> Result<Self, ConfigError> {
        let mut digest = Self::try_new(compression)?;
        if let Some((mean, weight)) = centroids
            .iter()
            .find(|(m, w)| !m.is_finite() || !w.is_finite() || *w < 0.)
        {
            return Err(ConfigError::InvalidCentroids(format!(
                "mean={mean} weight={weight}"
            )));
        }
        centroids.retain(|(_, w)| *w > 0.);
        if centroids.is_empty() {
            return Ok(digest);
        }

        centroids.sort_by(|a, b| a.0.total_cmp(&b.0));
        let count: f64 = centroids.iter().map(|(_, w)| w).sum();
        let sum: f64 = centroids.iter().map(|(m, w)| m * w).sum();
        let outermost = (centroids[0].0, centroids[centroids.len() - 1].0);
        let (min, max) = extremes.unwrap_or(outermost);
        let centroids = centroids
            .into_iter()
            .map(|(m, w)| Centroid::new(m, w))
            .collect();
        digest.inner = TDigest::new(centroids, sum, count, max, min, max_size(compression));
        Ok(digest)
    }

    /// Parse the `"mean weight;mean weight;"` form written to report files. Min and max fall back
    /// to the outermost means.
    pub fn from_centroid_blob(compression: f64, blob: &str) -> Result<Self, ConfigError> {
        let mut centroids = vec![];
        for pair in blob.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let mut parts = pair.split_whitespace();
            let parsed = match (parts.next(), parts.next(), parts.next()) {
                (Some(mean), Some(weight), None) => mean
                    .parse::<f64>()
                    .and_then(|m| weight.parse::<f64>().map(|w| (m, w)))
                    .ok(),
                _ => None,
            };
            match parsed {
                Some(c) => centroids.push(c),
                None => return Err(ConfigError::InvalidCentroids(pair.to_string())),
            }
        }
        Self::from_parts(compression, centroids, None)
    }

    pub fn compression(&self) -> f64 {
        self.compression
    }

    /// Non-finite values are ignored.
    pub fn insert(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.buffer.push(value);
        if self.buffer.len() >= BUFFER_LEN {
            self.compress();
        }
    }

    /// Fold `other` into `self`. The result summarizes the union of both sample populations.
    pub fn merge(&mut self, other: &Digest) -> Result<(), ConfigError> {
        if self.compression != other.compression {
            return Err(ConfigError::CompressionMismatch {
                left: self.compression,
                right: other.compression,
            });
        }
        if other.is_empty() {
            return Ok(());
        }

        self.compress();
        let other = other.folded().into_owned();
        // An all-empty merge falls back to the crate's default size, so skip it.
        self.inner = if self.inner.count() <= 0. {
            other
        } else {
            TDigest::merge_digests(vec![self.inner.clone(), other])
        };
        Ok(())
    }

    /// Fold any buffered samples into the centroid list.
    pub fn compress(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let buffer = std::mem::take(&mut self.buffer);
        self.inner = self.inner.merge_unsorted(buffer);
    }

    /// Total weight, i.e. the approximate number of samples summarized.
    pub fn count(&self) -> f64 {
        self.inner.count() + self.buffer.len() as f64
    }

    pub fn is_empty(&self) -> bool {
        self.count() <= 0.
    }

    pub fn mean(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.folded().mean())
    }

    pub fn min(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.folded().min())
    }

    pub fn max(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.folded().max())
    }

    /// Approximate value at rank `q` (clamped to `[0, 1]`). `None` for an empty digest.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        let q = if q.is_nan() { 0. } else { q.clamp(0., 1.) };
        Some(self.folded().estimate_quantile(q))
    }

    pub fn to_centroid_blob(&self) -> String {
        let mut blob = String::new();
        for (mean, weight) in self.centroids() {
            // Writing to a String cannot fail.
            let _ = write!(blob, "{mean} {weight};");
        }
        blob
    }

    /// An empty digest with the same compression.
    pub fn cleared(&self) -> Digest {
        Digest::new(self.compression)
    }

    fn folded(&self) -> Cow<'_, TDigest> {
        if self.buffer.is_empty() {
            Cow::Borrowed(&self.inner)
        } else {
            Cow::Owned(self.inner.merge_unsorted(self.buffer.clone()))
        }
    }

    /// `(mean, weight)` of every centroid. `TDigest` only exposes its centroids through serde.
    fn centroids(&self) -> Vec<(f64, f64)> {
        if self.is_empty() {
            return vec![];
        }
        serde_json::to_value(self.folded().as_ref())
            .and_then(serde_json::from_value::<CentroidList>)
            .map(|list| list.centroids.into_iter().map(|c| (c.mean, c.weight)).collect())
            .unwrap_or_default()
    }
}

fn max_size(compression: f64) -> usize {
    (compression as usize).max(1)
}

#[derive(Deserialize)]
struct CentroidList {
    centroids: Vec<CentroidEntry>,
}

#[derive(Deserialize)]
struct CentroidEntry {
    mean: f64,
    weight: f64,
}

/// Wire form of a [`Digest`]: compressed centroids as `[mean, weight]` pairs plus exact extremes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SerializedDigest {
    compression: f64,
    min: Option<f64>,
    max: Option<f64>,
    centroids: Vec<[f64; 2]>,
}

impl From<Digest> for SerializedDigest {
    fn from(digest: Digest) -> Self {
        Self {
            compression: digest.compression,
            min: digest.min(),
            max: digest.max(),
            centroids: digest.centroids().into_iter().map(|(m, w)| [m, w]).collect(),
        }
    }
}

impl TryFrom<SerializedDigest> for Digest {
    type Error = ConfigError;

    fn try_from(value: SerializedDigest) -> Result<Self, Self::Error> {
        let extremes = value.min.zip(value.max);
        let centroids = value.centroids.into_iter().map(|[m, w]| (m, w)).collect();
        Digest::from_parts(value.compression, centroids, extremes)
    }
}
