//! Prometheus exposition of write batcher counters.
//!
//! [`MetricsCollector`] reads the batcher's atomic counters at scrape time;
//! nothing on the data path knows it exists. It holds only a weak handle,
//! so a collector that outlives its batcher simply reports nothing.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use promes::backend::MemoryStore;
//! use promes::batcher::WriteBatcher;
//! use promes::config::WriteConfig;
//! use promes::metrics::MetricsCollector;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let batcher = WriteBatcher::start(Arc::new(MemoryStore::new()), WriteConfig::default())?;
//! let registry = prometheus::Registry::new();
//! registry.register(Box::new(MetricsCollector::new(&batcher)?))?;
//!
//! let families = registry.gather();
//! assert!(families.iter().any(|f| f.get_name() == "es_adapter_flushed"));
//! # Ok(())
//! # }
//! ```

use std::sync::Weak;

use parking_lot::Mutex;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{GaugeVec, IntCounter, IntGauge, IntGaugeVec, Opts};

use crate::batcher::{BatcherStats, StatsSnapshot, WriteBatcher};
use crate::error::{MetricsError, Result};

/// Metric namespace shared by every exported series.
pub const NAMESPACE: &str = "es_adapter";

type Extract = fn(&StatsSnapshot) -> u64;

const COUNTERS: [(&str, &str, Extract); 10] = [
    ("flushed", "Number of times the flush interval has been invoked", |s| s.flushed),
    ("committed", "Number of times workers committed bulk requests", |s| s.committed),
    ("indexed", "Number of requests indexed", |s| s.indexed),
    ("created", "Number of requests that resulted in a created document", |s| s.created),
    ("updated", "Number of requests that resulted in an updated document", |s| s.updated),
    ("deleted", "Number of requests that resulted in a deleted document", |s| s.deleted),
    ("succeeded", "Number of requests that succeeded", |s| s.succeeded),
    ("failed", "Number of requests that failed", |s| s.failed),
    ("rejected", "Number of documents rejected because the queue was full", |s| s.rejected),
    ("skipped", "Number of samples skipped for a non-finite value", |s| s.skipped),
];

fn descriptor_error(e: prometheus::Error) -> MetricsError {
    MetricsError::Descriptor { source: e }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Collector exporting [`WriteBatcher`] statistics.
pub struct MetricsCollector {
    stats: Weak<BatcherStats>,
    counters: Vec<(IntCounter, Extract)>,
    queued: IntGauge,
    worker_queued: IntGaugeVec,
    worker_last_duration: GaugeVec,
    scrape: Mutex<()>,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("attached", &(self.stats.strong_count() > 0))
            .finish_non_exhaustive()
    }
}

impl MetricsCollector {
    /// Creates a collector over `batcher`'s counters.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Descriptor`] if a metric descriptor is
    /// rejected.
    pub fn new(batcher: &WriteBatcher) -> Result<Self> {
        let counters = COUNTERS
            .iter()
            .map(|&(name, help, extract)| {
                IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))
                    .map(|counter| (counter, extract))
                    .map_err(descriptor_error)
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let queued = IntGauge::with_opts(
            Opts::new("queued", "Number of queued documents").namespace(NAMESPACE),
        )
        .map_err(descriptor_error)?;
        let worker_queued = IntGaugeVec::new(
            Opts::new("worker_queued", "Number of documents pending in a worker").namespace(NAMESPACE),
            &["worker"],
        )
        .map_err(descriptor_error)?;
        let worker_last_duration = GaugeVec::new(
            Opts::new(
                "worker_last_duration_seconds",
                "Duration of a worker's last bulk request",
            )
            .namespace(NAMESPACE),
            &["worker"],
        )
        .map_err(descriptor_error)?;

        Ok(Self {
            stats: std::sync::Arc::downgrade(batcher.stats_handle()),
            counters,
            queued,
            worker_queued,
            worker_last_duration,
            scrape: Mutex::new(()),
        })
    }
}

impl Collector for MetricsCollector {
    fn desc(&self) -> Vec<&Desc> {
        let mut descs: Vec<&Desc> = self
            .counters
            .iter()
            .flat_map(|(counter, _)| counter.desc())
            .collect();
        descs.extend(self.queued.desc());
        descs.extend(self.worker_queued.desc());
        descs.extend(self.worker_last_duration.desc());
        descs
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let Some(stats) = self.stats.upgrade() else {
            return Vec::new();
        };
        let snapshot = stats.snapshot();

        let _scrape = self.scrape.lock();
        let mut families = Vec::with_capacity(self.counters.len() + 3);

        for (counter, extract) in &self.counters {
            counter.reset();
            counter.inc_by(extract(&snapshot));
            families.extend(counter.collect());
        }

        self.queued.set(saturating_i64(snapshot.queued));
        families.extend(self.queued.collect());

        for (id, worker) in snapshot.workers.iter().enumerate() {
            let label = id.to_string();
            self.worker_queued
                .with_label_values(&[label.as_str()])
                .set(saturating_i64(worker.pending as u64));
            self.worker_last_duration
                .with_label_values(&[label.as_str()])
                .set(worker.last_flush.as_secs_f64());
        }
        families.extend(self.worker_queued.collect());
        families.extend(self.worker_last_duration.collect());

        families
    }
}
