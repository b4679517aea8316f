//! HTTP front end for Prometheus remote storage.
//!
//! Endpoints:
//!
//! - `POST /write`: snappy-framed `WriteRequest`, answered with 204
//! - `POST /read`: snappy-framed `ReadRequest`, answered with a `ReadResponse`
//! - `GET  /metrics`: batcher counters in text exposition format (with `--stats`)
//! - `GET  /healthz`: 200 while the cluster is green or yellow, 503 otherwise
//!
//! Reads and health checks call the blocking backend client, so they run on
//! the blocking pool. Writes only enqueue and stay on the async workers.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use prometheus::{Encoder, Registry, TextEncoder};
use promes::error::QueryError;
use promes::{DocumentStore, PromesError, QueryEngine, WriteBatcher, remote};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Write path.
    pub batcher: Arc<WriteBatcher>,
    /// Read path.
    pub engine: Arc<QueryEngine>,
    /// Backend, for health checks.
    pub store: Arc<dyn DocumentStore>,
    /// Registry served on `/metrics`; `None` leaves the route out.
    pub registry: Option<Registry>,
}

/// Builds the adapter's router.
pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/write", post(handle_write))
        .route("/read", post(handle_read))
        .route("/healthz", get(handle_health));
    if state.registry.is_some() {
        router = router.route("/metrics", get(handle_metrics));
    }
    router.with_state(state)
}

/// Maps a read failure onto an HTTP status.
fn status_for(err: &PromesError) -> StatusCode {
    match err {
        PromesError::Protocol(_)
        | PromesError::Query(
            QueryError::UnknownMatcher { .. } | QueryError::InvalidTimeRange { .. },
        ) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: &PromesError) -> Response {
    let status = status_for(err);
    if status.is_server_error() {
        tracing::error!(error = %err, "remote read failed");
    } else {
        tracing::warn!(error = %err, "rejecting remote read");
    }
    (status, err.to_string()).into_response()
}

/// `POST /write`
async fn handle_write(State(state): State<AppState>, body: Bytes) -> Response {
    let series = match remote::decode_write_request(&body) {
        Ok(series) => series,
        Err(e) => {
            tracing::warn!(error = %e, bytes = body.len(), "rejecting remote write");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let enqueued = state.batcher.write(&series);
    tracing::debug!(series = series.len(), enqueued, "remote write");
    StatusCode::NO_CONTENT.into_response()
}

/// `POST /read`
async fn handle_read(State(state): State<AppState>, body: Bytes) -> Response {
    let queries = match remote::decode_read_request(&body) {
        Ok(queries) => queries,
        Err(e) => return error_response(&e),
    };

    let engine = Arc::clone(&state.engine);
    let results = match tokio::task::spawn_blocking(move || engine.read(&queries)).await {
        Ok(Ok(results)) => results,
        Ok(Err(e)) => return error_response(&e),
        Err(e) => {
            tracing::error!(error = %e, "read task failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match remote::encode_read_response(&results) {
        Ok(body) => (
            [
                (header::CONTENT_TYPE, "application/x-protobuf"),
                (header::CONTENT_ENCODING, "snappy"),
            ],
            body,
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<AppState>) -> Response {
    let Some(registry) = state.registry.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        tracing::error!(error = %e, "metrics encoding failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], buffer).into_response()
}

/// `GET /healthz`
async fn handle_health(State(state): State<AppState>) -> Response {
    let store = Arc::clone(&state.store);
    match tokio::task::spawn_blocking(move || store.cluster_health()).await {
        Ok(Ok(health)) if health.is_serviceable() => (StatusCode::OK, Json(health)).into_response(),
        Ok(Ok(health)) => (StatusCode::SERVICE_UNAVAILABLE, Json(health)).into_response(),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "health task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::Request;
    use promes::backend::{HealthStatus, MemoryStore};
    use promes::config::{IndexConfig, ReadConfig, WriteConfig};
    use promes::lifecycle::bootstrap;
    use promes::{LabelMatcher, Labels, MatchKind, MetricsCollector, Query, Sample, TimeSeries};
    use tower::ServiceExt;

    const ALIAS: &str = "prom-metrics";

    fn setup(stats: bool) -> (Arc<MemoryStore>, AppState) {
        let store = Arc::new(MemoryStore::new());
        bootstrap(store.as_ref(), &IndexConfig::new(ALIAS)).unwrap();

        let batcher = Arc::new(WriteBatcher::start(store.clone(), WriteConfig::new(ALIAS)).unwrap());
        let engine =
            Arc::new(QueryEngine::new(store.clone(), ReadConfig::for_alias(ALIAS)).unwrap());
        let registry = stats.then(|| {
            let registry = Registry::new();
            registry
                .register(Box::new(MetricsCollector::new(&batcher).unwrap()))
                .unwrap();
            registry
        });

        let state = AppState {
            batcher,
            engine,
            store: store.clone(),
            registry,
        };
        (store, state)
    }

    fn post_body(uri: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_ENCODING, "snappy")
            .header(header::CONTENT_TYPE, "application/x-protobuf")
            .body(Body::from(body))
            .unwrap()
    }

    fn get_path(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (_store, state) = setup(false);
        let app = router(state.clone());

        let written = vec![TimeSeries::new(
            Labels::from_pairs([("__name__", "up"), ("job", "api")]),
            vec![Sample::new(1.0, 1_000), Sample::new(0.0, 2_000)],
        )];
        let response = app
            .clone()
            .oneshot(post_body(
                "/write",
                remote::encode_write_request(&written).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        state.batcher.close().unwrap();

        let query = Query::new(
            vec![LabelMatcher::new(MatchKind::Equal, "job", "api")],
            0,
            10_000,
        );
        let response = app
            .oneshot(post_body(
                "/read",
                remote::encode_read_request(&[query]).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_ENCODING],
            "snappy"
        );

        let results = remote::decode_read_response(&body_bytes(response).await).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].timeseries, written);
    }

    #[tokio::test]
    async fn test_garbage_write_is_bad_request() {
        let (_store, state) = setup(false);
        let response = router(state)
            .oneshot(post_body("/write", b"not snappy at all".to_vec()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_matcher_is_bad_request() {
        let (_store, state) = setup(false);
        let query = Query::new(
            vec![LabelMatcher::new(MatchKind::Unknown(9), "job", "api")],
            0,
            10,
        );
        let response = router(state)
            .oneshot(post_body(
                "/read",
                remote::encode_read_request(&[query]).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_backend_failure_is_server_error() {
        let (store, state) = setup(false);
        store.set_unavailable(true);
        let response = router(state)
            .oneshot(post_body(
                "/read",
                remote::encode_read_request(&[Query::new(vec![], 0, 10)]).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_health_follows_cluster_status() {
        let (store, state) = setup(false);
        let app = router(state);

        let response = app.clone().oneshot(get_path("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        store.set_health(HealthStatus::Yellow);
        let response = app.clone().oneshot(get_path("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        store.set_health(HealthStatus::Red);
        let response = app.clone().oneshot(get_path("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        store.set_health(HealthStatus::Green);
        store.set_unavailable(true);
        let response = app.oneshot(get_path("/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_only_with_stats() {
        let (_store, state) = setup(true);
        let response = router(state).oneshot(get_path("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(text.contains("es_adapter_flushed"));
        assert!(text.contains("es_adapter_queued"));

        let (_store, state) = setup(false);
        let response = router(state).oneshot(get_path("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
