//! Label sets, fingerprints and the persisted sample document.
//!
//! A time series is identified by its full label set, including the
//! reserved `__name__` label. Every sample is stored as its own document
//! carrying that label set, so the label set is the only thing that ties
//! documents of one series back together on the read path.
//!
//! # Example
//!
//! ```rust
//! use promes::series::{Labels, Sample, TimeSeries};
//!
//! let labels = Labels::from_pairs([("__name__", "up"), ("job", "node")]);
//! let series = TimeSeries::new(labels, vec![Sample::new(1.0, 1_700_000_000_000)]);
//!
//! for doc in series.documents() {
//!     assert_eq!(doc.label.get("job"), Some("node"));
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher;

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};

/// Name of the reserved metric-name label.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Separator hashed after every label name and value.
///
/// `0xff` never occurs in valid UTF-8, so `{a="bc"}` and `{ab="c"}` hash
/// differently.
const SEPARATOR: u8 = 0xff;

/// A set of label name/value pairs.
///
/// Names are unique and iteration is always in name order, regardless of
/// the order labels were inserted in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    /// Creates an empty label set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a label set from name/value pairs. Later duplicates win.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Inserts a label, replacing any previous value for `name`.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Returns the value of label `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no labels.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates labels in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Computes the fingerprint of this label set.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = FnvHasher::default();
        for (name, value) in &self.0 {
            hasher.write(name.as_bytes());
            hasher.write_u8(SEPARATOR);
            hasher.write(value.as_bytes());
            hasher.write_u8(SEPARATOR);
        }
        Fingerprint(hasher.finish())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Labels {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value:?}")?;
        }
        f.write_str("}")
    }
}

/// Deterministic 64-bit hash of a label set.
///
/// Equal label sets always produce equal fingerprints; distinct sets
/// collide only with hash-collision probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// One observation of a series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// The observed value.
    pub value: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl Sample {
    /// Creates a sample.
    pub fn new(value: f64, timestamp: i64) -> Self {
        Self { value, timestamp }
    }
}

/// A label set with its samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeSeries {
    /// Identifying labels.
    pub labels: Labels,
    /// Samples, in whatever order the producer supplied them.
    pub samples: Vec<Sample>,
}

impl TimeSeries {
    /// Creates a time series.
    pub fn new(labels: Labels, samples: Vec<Sample>) -> Self {
        Self { labels, samples }
    }

    /// Expands the series into one document per sample.
    ///
    /// Samples with non-finite values are left out.
    pub fn documents(&self) -> impl Iterator<Item = SampleDocument> + '_ {
        self.samples
            .iter()
            .filter(|s| s.value.is_finite())
            .map(|s| SampleDocument {
                label: self.labels.clone(),
                value: s.value,
                timestamp: s.timestamp,
            })
    }
}

/// The unit persisted in the document store: one sample with its full
/// label set.
///
/// Serializes as `{"label": {...}, "value": 1.0, "timestamp": 1700000000000}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleDocument {
    /// Labels of the owning series.
    pub label: Labels,
    /// Sample value. Always finite.
    pub value: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl SampleDocument {
    /// Returns the sample carried by this document.
    pub fn sample(&self) -> Sample {
        Sample::new(self.value, self.timestamp)
    }
}
