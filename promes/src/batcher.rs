//! Write path: time series to bulk requests.
//!
//! [`WriteBatcher::write`] expands each series into one document per
//! sample and offers them to a bounded queue without ever waiting on the
//! backend. A fixed pool of flush workers drains the queue; each worker
//! keeps its own pending batch and submits it as one bulk request when it
//! reaches the document-count or byte-size threshold, or when the age
//! threshold passes since that worker's last flush.
//!
//! Delivery is at-most-once. A batch that fails in transport is logged and
//! counted, not retried, and per-document rejections are logged with the
//! backend's error detail.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use promes::backend::MemoryStore;
//! use promes::batcher::WriteBatcher;
//! use promes::config::WriteConfig;
//! use promes::series::{Labels, Sample, TimeSeries};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new());
//! let batcher = WriteBatcher::start(store, WriteConfig::new("prom-metrics"))?;
//!
//! let series = TimeSeries::new(
//!     Labels::from_pairs([("__name__", "up")]),
//!     vec![Sample::new(1.0, 1_700_000_000_000)],
//! );
//! assert_eq!(batcher.write(&[series]), 1);
//!
//! batcher.close()?;
//! assert_eq!(batcher.stats().queued, 0);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError, select};
use parking_lot::{Mutex, RwLock};
use tracing::{Span, debug, error, info, info_span, warn};

use crate::backend::{BulkOperation, BulkResult, DocumentStore};
use crate::config::WriteConfig;
use crate::error::{BatcherError, PromesError, Result};
use crate::series::TimeSeries;

/// Counters of one flush worker.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pending: AtomicUsize,
    last_flush_nanos: AtomicU64,
    commits: AtomicU64,
}

/// Lock-free counters shared between the batcher, its workers and the
/// metrics collector.
#[derive(Debug)]
pub struct BatcherStats {
    flushed: AtomicU64,
    committed: AtomicU64,
    indexed: AtomicU64,
    created: AtomicU64,
    updated: AtomicU64,
    deleted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    skipped: AtomicU64,
    workers: Vec<WorkerStats>,
    queue: Receiver<BulkOperation>,
}

impl BatcherStats {
    fn new(workers: usize, queue: Receiver<BulkOperation>) -> Self {
        Self {
            flushed: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            indexed: AtomicU64::new(0),
            created: AtomicU64::new(0),
            updated: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            workers: (0..workers).map(|_| WorkerStats::default()).collect(),
            queue,
        }
    }

    /// Documents waiting in the queue or in a worker's pending batch.
    pub fn queued(&self) -> u64 {
        let pending: usize = self
            .workers
            .iter()
            .map(|w| w.pending.load(Ordering::Relaxed))
            .sum();
        (self.queue.len() + pending) as u64
    }

    /// Takes a consistent-enough copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            flushed: load(&self.flushed),
            committed: load(&self.committed),
            indexed: load(&self.indexed),
            created: load(&self.created),
            updated: load(&self.updated),
            deleted: load(&self.deleted),
            succeeded: load(&self.succeeded),
            failed: load(&self.failed),
            rejected: load(&self.rejected),
            skipped: load(&self.skipped),
            queued: self.queued(),
            workers: self
                .workers
                .iter()
                .map(|w| WorkerSnapshot {
                    pending: w.pending.load(Ordering::Relaxed),
                    last_flush: Duration::from_nanos(w.last_flush_nanos.load(Ordering::Relaxed)),
                    commits: w.commits.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }
}

/// Point-in-time copy of [`BatcherStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Flushes that submitted a bulk request.
    pub flushed: u64,
    /// Bulk requests the backend answered.
    pub committed: u64,
    /// Items reported in bulk replies.
    pub indexed: u64,
    /// Items with result `created`.
    pub created: u64,
    /// Items with result `updated`.
    pub updated: u64,
    /// Items with result `deleted`.
    pub deleted: u64,
    /// Items with a 2xx status.
    pub succeeded: u64,
    /// Items that failed, plus every document of a failed bulk request.
    pub failed: u64,
    /// Documents refused because the queue was full or closed.
    pub rejected: u64,
    /// Samples dropped for a non-finite value.
    pub skipped: u64,
    /// Documents waiting in the queue or a pending batch.
    pub queued: u64,
    /// Per-worker state.
    pub workers: Vec<WorkerSnapshot>,
}

/// Point-in-time copy of one worker's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerSnapshot {
    /// Documents in the worker's pending batch.
    pub pending: usize,
    /// Duration of the worker's last bulk request.
    pub last_flush: Duration,
    /// Bulk requests the worker got an answer for.
    pub commits: u64,
}

/// Why a pending batch was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Document-count threshold reached.
    Count,
    /// Byte-size threshold reached.
    Size,
    /// Age threshold passed.
    Age,
    /// The batcher is closing.
    Close,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Count => "count",
            Self::Size => "size",
            Self::Age => "age",
            Self::Close => "close",
        })
    }
}

/// A worker's accumulated, not yet submitted operations.
#[derive(Debug)]
pub struct PendingBatch {
    ops: Vec<BulkOperation>,
    bytes: usize,
    started: Instant,
}

impl PendingBatch {
    /// Creates an empty batch whose age starts now.
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: Vec::with_capacity(capacity),
            bytes: 0,
            started: Instant::now(),
        }
    }

    /// Adds an operation.
    pub fn push(&mut self, op: BulkOperation) {
        self.bytes += op.estimated_size();
        self.ops.push(op);
    }

    /// Number of pending operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns `true` if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Estimated bulk body size of the pending operations.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Time since the batch was last reset.
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left until the age threshold passes.
    pub fn time_left(&self, config: &WriteConfig) -> Duration {
        config.max_age.saturating_sub(self.age())
    }

    /// Returns the first threshold the batch has reached, if any.
    pub fn should_flush(&self, config: &WriteConfig) -> Option<FlushReason> {
        if self.ops.len() >= config.max_docs {
            Some(FlushReason::Count)
        } else if self.bytes >= config.max_bytes {
            Some(FlushReason::Size)
        } else if self.age() >= config.max_age {
            Some(FlushReason::Age)
        } else {
            None
        }
    }

    /// Takes every pending operation and resets count, bytes and age
    /// together.
    pub fn take(&mut self) -> Vec<BulkOperation> {
        self.bytes = 0;
        self.started = Instant::now();
        let capacity = self.ops.capacity();
        std::mem::replace(&mut self.ops, Vec::with_capacity(capacity))
    }
}

/// Batches decoded time series into bulk requests on a worker pool.
pub struct WriteBatcher {
    sender: RwLock<Option<Sender<BulkOperation>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<BatcherStats>,
    config: WriteConfig,
    span: Span,
}

impl fmt::Debug for WriteBatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteBatcher")
            .field("config", &self.config)
            .field("closed", &self.sender.read().is_none())
            .finish_non_exhaustive()
    }
}

impl WriteBatcher {
    /// Validates `config` and starts the flush workers.
    ///
    /// # Errors
    ///
    /// Returns a config error for an invalid configuration, or
    /// [`BatcherError::Spawn`] if a worker thread cannot be started.
    pub fn start(store: Arc<dyn DocumentStore>, config: WriteConfig) -> Result<Self> {
        config.validate()?;

        let span = info_span!("write_batcher", alias = %config.alias);
        let (sender, receiver) = crossbeam_channel::bounded(config.queue_capacity);
        let stats = Arc::new(BatcherStats::new(config.workers, receiver.clone()));

        let mut handles = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let worker = FlushWorker {
                id,
                queue: receiver.clone(),
                store: Arc::clone(&store),
                config: config.clone(),
                stats: Arc::clone(&stats),
                span: info_span!(parent: &span, "flush_worker", worker = id),
            };
            let handle = std::thread::Builder::new()
                .name(format!("promes-flush-{id}"))
                .spawn(move || worker.run())
                .map_err(|e| BatcherError::Spawn {
                    worker: id,
                    source: e,
                })?;
            handles.push(handle);
        }

        span.in_scope(|| {
            info!(
                workers = config.workers,
                max_docs = config.max_docs,
                max_bytes = config.max_bytes,
                max_age_ms = u64::try_from(config.max_age.as_millis()).unwrap_or(u64::MAX),
                "write batcher started"
            );
        });

        Ok(Self {
            sender: RwLock::new(Some(sender)),
            workers: Mutex::new(handles),
            stats,
            config,
            span,
        })
    }

    /// Enqueues one document per finite sample of every series.
    ///
    /// Never waits on the backend. Samples with non-finite values are
    /// skipped and documents that do not fit in the queue are rejected;
    /// both are counted. Returns the number of documents enqueued.
    pub fn write(&self, series: &[TimeSeries]) -> usize {
        let _enter = self.span.enter();

        let mut ops = Vec::with_capacity(series.iter().map(|ts| ts.samples.len()).sum());
        let mut rejected = 0u64;
        let mut skipped = 0u64;

        for ts in series {
            let mut finite = 0;
            for doc in ts.documents() {
                finite += 1;
                match BulkOperation::new(self.config.alias.as_str(), &doc) {
                    Ok(op) => ops.push(op),
                    Err(e) => {
                        error!(error = %e, labels = %ts.labels, "failed to serialize sample");
                        rejected += 1;
                    }
                }
            }

            let dropped = ts.samples.len() - finite;
            if dropped > 0 {
                debug!(labels = %ts.labels, skipped = dropped, "skipping non-finite samples");
                skipped += dropped as u64;
            }
        }

        // Only the appends run under the sender lock.
        let mut enqueued = 0;
        {
            let guard = self.sender.read();
            match guard.as_ref() {
                Some(sender) => {
                    for op in ops {
                        match sender.try_send(op) {
                            Ok(()) => enqueued += 1,
                            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                                rejected += 1;
                            }
                        }
                    }
                }
                None => rejected += ops.len() as u64,
            }
        }

        if skipped > 0 {
            self.stats.skipped.fetch_add(skipped, Ordering::Relaxed);
        }
        if rejected > 0 {
            self.stats.rejected.fetch_add(rejected, Ordering::Relaxed);
            warn!(
                rejected,
                enqueued,
                capacity = self.config.queue_capacity,
                "write queue full or closed, documents rejected"
            );
        }

        enqueued
    }

    /// Stops accepting documents, drains everything already queued, and
    /// joins the workers after their final flush.
    ///
    /// Safe to call more than once; later calls return immediately.
    ///
    /// # Errors
    ///
    /// Returns [`BatcherError::WorkerPanicked`] if a worker panicked. All
    /// workers are joined regardless.
    pub fn close(&self) -> Result<()> {
        let _enter = self.span.enter();
        let sender = self.sender.write().take();
        let first_close = sender.is_some();
        drop(sender);

        let handles = std::mem::take(&mut *self.workers.lock());
        let mut result = Ok(());
        for (worker, handle) in handles.into_iter().enumerate() {
            if handle.join().is_err() {
                error!(worker, "flush worker panicked");
                if result.is_ok() {
                    result = Err(PromesError::from(BatcherError::WorkerPanicked { worker }));
                }
            }
        }

        if first_close {
            let stats = self.stats.snapshot();
            info!(
                flushed = stats.flushed,
                succeeded = stats.succeeded,
                failed = stats.failed,
                rejected = stats.rejected,
                "write batcher closed"
            );
        }
        result
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Returns a snapshot of the batcher's counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Shared handle to the live counters.
    pub fn stats_handle(&self) -> &Arc<BatcherStats> {
        &self.stats
    }

    /// Returns the batcher's configuration.
    pub fn config(&self) -> &WriteConfig {
        &self.config
    }
}

impl Drop for WriteBatcher {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(error = %e, "write batcher did not shut down cleanly");
        }
    }
}

/// State owned by one flush worker thread.
struct FlushWorker {
    id: usize,
    queue: Receiver<BulkOperation>,
    store: Arc<dyn DocumentStore>,
    config: WriteConfig,
    stats: Arc<BatcherStats>,
    span: Span,
}

impl FlushWorker {
    fn run(self) {
        let _enter = self.span.enter();
        let mut batch = PendingBatch::new(self.config.max_docs);

        loop {
            select! {
                recv(self.queue) -> msg => match msg {
                    Ok(op) => {
                        batch.push(op);
                        self.set_pending(batch.len());
                        if let Some(reason) = batch.should_flush(&self.config) {
                            self.flush(&mut batch, reason);
                        }
                    }
                    Err(_) => break,
                },
                default(batch.time_left(&self.config)) => {
                    self.flush(&mut batch, FlushReason::Age);
                }
            }
        }

        self.flush(&mut batch, FlushReason::Close);
        debug!("flush worker stopped");
    }

    fn set_pending(&self, pending: usize) {
        self.stats.workers[self.id]
            .pending
            .store(pending, Ordering::Relaxed);
    }

    fn flush(&self, batch: &mut PendingBatch, reason: FlushReason) {
        let bytes = batch.bytes();
        let ops = batch.take();
        self.set_pending(0);
        if ops.is_empty() {
            return;
        }

        let stats = &self.stats;
        let worker = &stats.workers[self.id];
        stats.flushed.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let outcome = self.store.bulk(&ops);
        let elapsed = started.elapsed();
        worker.last_flush_nanos.store(
            u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );

        match outcome {
            Ok(response) => {
                stats.committed.fetch_add(1, Ordering::Relaxed);
                worker.commits.fetch_add(1, Ordering::Relaxed);

                let mut failed = 0u64;
                for item in &response.items {
                    stats.indexed.fetch_add(1, Ordering::Relaxed);
                    match item.result {
                        Some(BulkResult::Created) => {
                            stats.created.fetch_add(1, Ordering::Relaxed);
                        }
                        Some(BulkResult::Updated) => {
                            stats.updated.fetch_add(1, Ordering::Relaxed);
                        }
                        Some(BulkResult::Deleted) => {
                            stats.deleted.fetch_add(1, Ordering::Relaxed);
                        }
                        _ => {}
                    }
                    if item.is_success() {
                        stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    } else {
                        failed += 1;
                        error!(
                            index = %item.index,
                            status = item.status,
                            error = ?item.error,
                            "document rejected by backend"
                        );
                    }
                }
                stats.failed.fetch_add(failed, Ordering::Relaxed);

                debug!(
                    %reason,
                    documents = ops.len(),
                    bytes,
                    failed,
                    elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "batch flushed"
                );
            }
            Err(e) => {
                stats
                    .failed
                    .fetch_add(ops.len() as u64, Ordering::Relaxed);
                error!(
                    error = %e,
                    %reason,
                    documents = ops.len(),
                    "bulk request failed, batch dropped"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryStore;
    use crate::series::{Labels, Sample};

    fn op(bytes: usize) -> BulkOperation {
        BulkOperation {
            index: "m".to_string(),
            source: vec![b'x'; bytes],
        }
    }

    fn config() -> WriteConfig {
        WriteConfig::new("m")
            .with_max_docs(3)
            .with_max_bytes(1 << 20)
            .with_max_age(Duration::from_secs(60))
    }

    #[test]
    fn test_pending_batch_count_threshold() {
        let config = config();
        let mut batch = PendingBatch::new(3);
        batch.push(op(10));
        batch.push(op(10));
        assert_eq!(batch.should_flush(&config), None);
        batch.push(op(10));
        assert_eq!(batch.should_flush(&config), Some(FlushReason::Count));
    }

    #[test]
    fn test_pending_batch_size_threshold() {
        let config = config().with_max_bytes(100);
        let mut batch = PendingBatch::new(3);
        batch.push(op(50));
        assert_eq!(batch.should_flush(&config), None);
        batch.push(op(50));
        assert_eq!(batch.should_flush(&config), Some(FlushReason::Size));
    }

    #[test]
    fn test_pending_batch_age_threshold() {
        let config = config().with_max_age(Duration::from_millis(10));
        let batch = PendingBatch::new(3);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(batch.should_flush(&config), Some(FlushReason::Age));
        assert_eq!(batch.time_left(&config), Duration::ZERO);
    }

    #[test]
    fn test_pending_batch_take_resets_everything() {
        let config = config().with_max_age(Duration::from_millis(30));
        let mut batch = PendingBatch::new(3);
        batch.push(op(10));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(batch.should_flush(&config), Some(FlushReason::Age));

        let taken = batch.take();
        assert_eq!(taken.len(), 1);
        assert!(batch.is_empty());
        assert!(batch.ops.capacity() >= 3);
        assert_eq!(batch.bytes(), 0);
        assert!(batch.age() < Duration::from_millis(30));
        assert_eq!(batch.should_flush(&config), None);
    }

    #[test]
    fn test_write_skips_non_finite() {
        let store = Arc::new(MemoryStore::new());
        let batcher = WriteBatcher::start(store, config()).unwrap();
        let series = TimeSeries::new(
            Labels::from_pairs([("__name__", "up")]),
            vec![
                Sample::new(1.0, 1),
                Sample::new(f64::NAN, 2),
                Sample::new(f64::INFINITY, 3),
                Sample::new(2.0, 4),
            ],
        );
        assert_eq!(batcher.write(&[series]), 2);
        assert_eq!(batcher.stats().skipped, 2);
        batcher.close().unwrap();
    }

    #[test]
    fn test_write_after_close_rejected() {
        let store = Arc::new(MemoryStore::new());
        let batcher = WriteBatcher::start(store, config()).unwrap();
        batcher.close().unwrap();
        assert!(batcher.is_closed());

        let series = TimeSeries::new(Labels::new(), vec![Sample::new(1.0, 1)]);
        assert_eq!(batcher.write(&[series]), 0);
        assert_eq!(batcher.stats().rejected, 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let batcher = WriteBatcher::start(store, config()).unwrap();
        batcher.close().unwrap();
        batcher.close().unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let store = Arc::new(MemoryStore::new());
        assert!(WriteBatcher::start(store, config().with_workers(0)).is_err());
    }

    #[test]
    fn test_flush_reason_display() {
        assert_eq!(FlushReason::Count.to_string(), "count");
        assert_eq!(FlushReason::Close.to_string(), "close");
    }
}
