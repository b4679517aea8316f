//! Prometheus remote storage adapter backed by Elasticsearch.
//!
//! Serves the remote write and remote read endpoints, keeps the write
//! alias rolling over, and optionally exposes its own batching counters.
//! Every flag can also be set through the environment variable of the same
//! name, upper-cased (`--es-url` is `ES_URL`).

mod api;
mod error;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use promes::config::{parse_byte_size, parse_duration};
use promes::{
    DocumentStore, ElasticClient, ElasticConfig, IndexConfig, IndexLifecycleManager, MemoryStore,
    MetricsCollector, QueryEngine, ReadConfig, RolloverConditions, WriteBatcher, WriteConfig,
};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::error::AdapterError;

/// Prometheus remote storage adapter for Elasticsearch.
#[derive(Parser, Debug)]
#[command(name = "promes-adapter", version, about)]
struct Cli {
    /// Elasticsearch base URL.
    #[arg(long, env, default_value = "http://localhost:9200")]
    es_url: String,

    /// Elasticsearch basic auth user.
    #[arg(long, env)]
    es_user: Option<String>,

    /// Elasticsearch basic auth password.
    #[arg(long, env, hide_env_values = true)]
    es_password: Option<String>,

    /// Elasticsearch request timeout.
    #[arg(long, env, default_value = "30s", value_parser = duration_arg)]
    es_timeout: Duration,

    /// Number of bulk flush workers.
    #[arg(long, env, default_value = "1")]
    es_workers: usize,

    /// Flush a batch once its oldest document is this old.
    #[arg(long, env, default_value = "10s", value_parser = duration_arg)]
    es_batch_max_age: Duration,

    /// Flush a batch once it holds this many documents.
    #[arg(long, env, default_value = "1000")]
    es_batch_max_docs: usize,

    /// Flush a batch once its bulk body reaches this size.
    #[arg(long, env, default_value = "4096", value_parser = size_arg)]
    es_batch_max_size: usize,

    /// Documents buffered ahead of the workers before writes are rejected.
    #[arg(long, env, default_value = "100000")]
    es_queue_capacity: usize,

    /// Write alias; the search alias is `<alias>-search`.
    #[arg(long, env, default_value = promes::config::DEFAULT_ALIAS)]
    es_alias: String,

    /// Primary shards per index.
    #[arg(long, env, default_value = "5")]
    es_index_shards: u32,

    /// Replicas per primary shard.
    #[arg(long, env, default_value = "1")]
    es_index_replicas: u32,

    /// Roll over once the write index is this old (0 disables).
    #[arg(long, env, default_value = "7d", value_parser = duration_arg)]
    es_index_max_age: Duration,

    /// Roll over once the write index holds this many documents (0 disables).
    #[arg(long, env, default_value = "1000000")]
    es_index_max_docs: u64,

    /// Roll over once the write index's primaries reach this size (0 disables).
    #[arg(long, env, default_value = "0", value_parser = byte_size_arg)]
    es_index_max_size: u64,

    /// How often rollover conditions are checked.
    #[arg(long, env, default_value = "5m", value_parser = duration_arg)]
    es_rollover_interval: Duration,

    /// Maximum documents returned per read query.
    #[arg(long, env, default_value = "1000")]
    es_search_max_docs: usize,

    /// Expose batcher counters on `/metrics`.
    #[arg(long, env)]
    stats: bool,

    /// Address the HTTP server listens on.
    #[arg(long, env, default_value = "0.0.0.0:8000")]
    listen: SocketAddr,

    /// Keep documents in process memory instead of Elasticsearch.
    #[arg(long, env)]
    in_memory: bool,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long, env)]
    debug: bool,
}

fn duration_arg(input: &str) -> Result<Duration, String> {
    parse_duration(input).map_err(|e| e.to_string())
}

fn byte_size_arg(input: &str) -> Result<u64, String> {
    parse_byte_size(input).map_err(|e| e.to_string())
}

fn size_arg(input: &str) -> Result<usize, String> {
    let bytes = byte_size_arg(input)?;
    usize::try_from(bytes).map_err(|_| format!("{input} does not fit in memory"))
}

impl Cli {
    fn write_config(&self) -> WriteConfig {
        WriteConfig::new(&self.es_alias)
            .with_workers(self.es_workers)
            .with_max_age(self.es_batch_max_age)
            .with_max_docs(self.es_batch_max_docs)
            .with_max_bytes(self.es_batch_max_size)
            .with_queue_capacity(self.es_queue_capacity)
    }

    fn index_config(&self) -> IndexConfig {
        IndexConfig::new(&self.es_alias)
            .with_shards(self.es_index_shards, self.es_index_replicas)
            .with_rollover(RolloverConditions {
                max_age: Some(self.es_index_max_age).filter(|d| !d.is_zero()),
                max_docs: Some(self.es_index_max_docs).filter(|&n| n > 0),
                max_size: Some(self.es_index_max_size).filter(|&n| n > 0),
            })
            .with_check_interval(self.es_rollover_interval)
    }

    fn read_config(&self) -> ReadConfig {
        ReadConfig::for_alias(&self.es_alias).with_max_docs(self.es_search_max_docs)
    }

    fn store(&self) -> Result<Arc<dyn DocumentStore>, AdapterError> {
        if self.in_memory {
            tracing::warn!("using in-memory store, documents are lost on exit");
            return Ok(Arc::new(MemoryStore::new()));
        }

        let mut config = ElasticConfig::new(&self.es_url).with_timeout(self.es_timeout);
        if let Some(user) = &self.es_user {
            config = config.with_basic_auth(user, self.es_password.clone());
        }
        let client = ElasticClient::new(config).map_err(promes::PromesError::from)?;
        Ok(Arc::new(client))
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(&cli) {
        tracing::error!(error = %e, "adapter failed");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), AdapterError> {
    let store = cli.store()?;
    tracing::info!(url = %cli.es_url, alias = %cli.es_alias, in_memory = cli.in_memory, "starting adapter");

    // Bootstrap failures end the process before anything listens.
    let mut lifecycle = IndexLifecycleManager::start(Arc::clone(&store), cli.index_config())?;
    let batcher = Arc::new(WriteBatcher::start(Arc::clone(&store), cli.write_config())?);
    let engine = Arc::new(QueryEngine::new(Arc::clone(&store), cli.read_config())?);

    let registry = if cli.stats {
        let registry = prometheus::Registry::new();
        let collector = MetricsCollector::new(&batcher)?;
        registry
            .register(Box::new(collector))
            .map_err(|source| AdapterError::Registry { source })?;
        Some(registry)
    } else {
        None
    };

    let state = AppState {
        batcher: Arc::clone(&batcher),
        engine,
        store: Arc::clone(&store),
        registry,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("promes-http")
        .build()
        .map_err(|source| AdapterError::Runtime { source })?;
    let served = runtime.block_on(serve(cli.listen, state));
    // The blocking backend client must not be dropped on a runtime thread.
    drop(runtime);

    lifecycle.stop();
    batcher.close()?;
    let stats = batcher.stats();
    tracing::info!(
        succeeded = stats.succeeded,
        failed = stats.failed,
        rejected = stats.rejected,
        "adapter stopped"
    );
    drop(store);
    served
}

async fn serve(addr: SocketAddr, state: AppState) -> Result<(), AdapterError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| AdapterError::Bind { addr, source })?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|source| AdapterError::Serve { source })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
