//! # promes
//!
//! Prometheus remote storage on an Elasticsearch-compatible document store.
//!
//! promes persists remote-write samples as one document per sample and
//! answers remote-read queries by searching those documents and regrouping
//! them into time series. Index growth is bounded by rolling a write alias
//! over to fresh index generations, all of which stay searchable.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - The write path never waits on the backend: documents go to a bounded
//!   queue and a fixed worker pool submits bulk requests
//! - Batches flush on document count, byte size, or age, whichever comes first
//! - At-most-once delivery; failures are logged and counted, never retried
//! - Label matchers translate one-to-one into filter and exclusion clauses
//! - Rollover is a single atomic alias swap performed by the backend
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use promes::{
//!     IndexConfig, IndexLifecycleManager, Labels, LabelMatcher, MatchKind, MemoryStore, Query,
//!     QueryEngine, ReadConfig, Sample, TimeSeries, WriteBatcher, WriteConfig,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new());
//!
//! // Template, first index and rollover thread
//! let _lifecycle = IndexLifecycleManager::start(store.clone(), IndexConfig::new("metrics"))?;
//!
//! // Write some samples, then flush them
//! let batcher = WriteBatcher::start(store.clone(), WriteConfig::new("metrics"))?;
//! batcher.write(&[TimeSeries::new(
//!     Labels::from_pairs([("__name__", "up"), ("job", "api")]),
//!     vec![Sample::new(1.0, 1_000), Sample::new(0.0, 2_000)],
//! )]);
//! batcher.close()?;
//!
//! // Read them back
//! let engine = QueryEngine::new(store, ReadConfig::for_alias("metrics"))?;
//! let results = engine.read(&[Query::new(
//!     vec![LabelMatcher::new(MatchKind::Equal, "job", "api")],
//!     0,
//!     10_000,
//! )])?;
//! assert_eq!(results[0].timeseries[0].samples.len(), 2);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`WriteBatcher`]: Bounded queue, flush workers, thresholds, counters
//! - [`QueryEngine`]: Matchers to searches, hits to time series
//! - [`IndexLifecycleManager`]: Template, initial index, periodic rollover
//! - [`MetricsCollector`]: Prometheus collector over batcher counters
//!
//! ## Modules
//!
//! - [`batcher`]: Write path
//! - [`query`]: Read path
//! - [`lifecycle`]: Index bootstrap and rollover
//! - [`metrics`]: Prometheus exposition
//! - [`remote`]: Remote-write/read protobuf and snappy framing
//! - [`backend`]: Document store trait, Elasticsearch client, in-memory store
//! - [`series`]: Labels, fingerprints, samples, documents
//! - [`config`]: Component configuration and value parsers
//! - [`error`]: Error types

pub mod backend;
pub mod batcher;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod query;
pub mod remote;
pub mod series;

// Re-export primary API types at crate root for convenience.
pub use backend::{DocumentStore, ElasticClient, ElasticConfig, MemoryStore};
pub use batcher::{StatsSnapshot, WriteBatcher};
pub use config::{IndexConfig, ReadConfig, RolloverConditions, WriteConfig};
pub use error::{PromesError, Result};
pub use lifecycle::{IndexLifecycleManager, RolloverOutcome};
pub use metrics::MetricsCollector;
pub use query::{LabelMatcher, MatchKind, Query, QueryEngine, QueryResult};
pub use series::{Fingerprint, Labels, Sample, SampleDocument, TimeSeries};
