//! Microbenchmarks for the write and read hot paths.
//!
//! Measures enqueue cost in `WriteBatcher::write` and the cost of turning
//! search hits back into time series.
//!
//! Run with: `cargo bench -p promes`

#![allow(missing_docs, clippy::cast_possible_truncation)]

use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use promes::backend::{MemoryStore, SearchHit};
use promes::config::{IndexConfig, ReadConfig, WriteConfig};
use promes::lifecycle::bootstrap;
use promes::query::{LabelMatcher, MatchKind, Query, QueryEngine, group_hits};
use promes::series::{Labels, Sample, TimeSeries};
use promes::WriteBatcher;

const ALIAS: &str = "bench-metrics";

/// Series shaped like a node exporter scrape.
fn scrape(series_count: u32, ts: i64) -> Vec<TimeSeries> {
    (0..series_count)
        .map(|i| {
            TimeSeries::new(
                Labels::from_pairs([
                    ("__name__", "node_cpu_seconds_total".to_string()),
                    ("cpu", format!("{i}")),
                    ("instance", "10.0.0.1:9100".to_string()),
                    ("job", "node".to_string()),
                ]),
                vec![Sample::new(f64::from(i) * 1.5, ts)],
            )
        })
        .collect()
}

fn setup_batcher() -> (Arc<MemoryStore>, WriteBatcher) {
    let store = Arc::new(MemoryStore::new());
    bootstrap(store.as_ref(), &IndexConfig::new(ALIAS)).unwrap();
    let config = WriteConfig::new(ALIAS)
        .with_workers(2)
        .with_max_docs(500)
        .with_max_age(Duration::from_millis(100))
        .with_queue_capacity(1_000_000);
    let batcher = WriteBatcher::start(store.clone(), config).unwrap();
    (store, batcher)
}

fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("write/series_count");

    for count in [1, 10, 100] {
        let (_store, batcher) = setup_batcher();
        let mut ts = 1_700_000_000_000i64;

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                ts += 1_000;
                black_box(batcher.write(black_box(&scrape(count, ts))));
            });
        });

        batcher.close().unwrap();
    }

    group.finish();
}

fn bench_build_search(c: &mut Criterion) {
    let store = Arc::new(MemoryStore::new());
    let engine = QueryEngine::new(store, ReadConfig::for_alias(ALIAS)).unwrap();
    let query = Query::new(
        vec![
            LabelMatcher::new(MatchKind::Equal, "__name__", "node_cpu_seconds_total"),
            LabelMatcher::new(MatchKind::NotEqual, "mode", "idle"),
            LabelMatcher::new(MatchKind::RegexMatch, "instance", "10\\.0\\..*"),
        ],
        1_700_000_000_000,
        1_700_000_600_000,
    );

    c.bench_function("read/build_search", |b| {
        b.iter(|| engine.build_search(black_box(&query)).unwrap());
    });
}

fn bench_group_hits(c: &mut Criterion) {
    let mut group = c.benchmark_group("read/group_hits");

    for count in [10, 100] {
        // 60 samples per series, interleaved the way a sorted search returns them.
        let hits: Vec<SearchHit> = (0..60)
            .flat_map(|step| scrape(count, 1_700_000_000_000 + step * 10_000))
            .flat_map(|series| series.documents().collect::<Vec<_>>())
            .enumerate()
            .map(|(i, doc)| SearchHit {
                index: format!("{ALIAS}-000001"),
                id: format!("{i}"),
                source: serde_json::to_value(&doc).unwrap(),
            })
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(count), &hits, |b, hits| {
            b.iter(|| group_hits(black_box(hits.clone())).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_write, bench_build_search, bench_group_hits);
criterion_main!(benches);
