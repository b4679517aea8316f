//! Elasticsearch REST client.
//!
//! A blocking HTTP transport for the [`DocumentStore`] contract. Request
//! bodies are the typed values from [`crate::backend`], serialized as JSON
//! (or NDJSON for bulk). Any non-2xx reply becomes
//! [`BackendError::Status`] carrying the response text, except where a
//! status has a specific meaning (404 on `HEAD`, 404 on search targets).

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{
    BackendResult, BulkOperation, BulkResponse, ClusterHealth, CreateIndex, DocumentStore,
    IndexTemplate, RolloverRequest, RolloverResponse, SearchRequest, SearchResponse,
};
use crate::error::BackendError;

/// Connection settings for an Elasticsearch cluster.
#[derive(Debug, Clone)]
pub struct ElasticConfig {
    /// Base URL, e.g. `http://localhost:9200`.
    pub url: String,
    /// Basic-auth user name.
    pub username: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl ElasticConfig {
    /// Creates a config with a 30s timeout and no credentials.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets basic-auth credentials.
    #[must_use]
    pub fn with_basic_auth(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.username = Some(username.into());
        self.password = password;
        self
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Blocking Elasticsearch client.
///
/// Holds one connection pool; clone-free sharing goes through `Arc`.
/// The client must be dropped outside of any async runtime.
#[derive(Debug)]
pub struct ElasticClient {
    client: Client,
    base_url: String,
    config: ElasticConfig,
}

impl ElasticClient {
    /// Builds a client for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::ClientCreate`] if the HTTP client cannot be
    /// built (e.g. the TLS backend fails to initialise).
    pub fn new(config: ElasticConfig) -> BackendResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BackendError::ClientCreate { source: e })?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            config,
        })
    }

    /// Returns the cluster base URL.
    pub fn url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{}", self.base_url, path.trim_start_matches('/')));
        match &self.config.username {
            Some(user) => builder.basic_auth(user, self.config.password.as_deref()),
            None => builder,
        }
    }

    fn json_body<T: Serialize>(operation: &'static str, value: &T) -> BackendResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| BackendError::Serde {
            operation,
            source: e,
        })
    }

    /// Sends a request and returns the response if it has a 2xx status.
    fn send(operation: &'static str, builder: RequestBuilder) -> BackendResult<Response> {
        let response = builder
            .send()
            .map_err(|e| BackendError::Request {
                operation,
                source: e,
            })?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        Err(BackendError::Status {
            operation,
            status,
            body,
        })
    }

    fn parse<T: DeserializeOwned>(operation: &'static str, response: Response) -> BackendResult<T> {
        let bytes = response.bytes().map_err(|e| BackendError::Request {
            operation,
            source: e,
        })?;
        serde_json::from_slice(&bytes).map_err(|e| BackendError::Serde {
            operation,
            source: e,
        })
    }
}

impl DocumentStore for ElasticClient {
    fn put_template(&self, name: &str, template: &IndexTemplate) -> BackendResult<()> {
        let body = Self::json_body("put_template", template)?;
        let builder = self
            .request(reqwest::Method::PUT, &format!("_template/{name}"))
            .header("Content-Type", "application/json")
            .body(body);
        Self::send("put_template", builder)?;
        debug!(template = name, "index template registered");
        Ok(())
    }

    fn exists(&self, name: &str) -> BackendResult<bool> {
        let response = self
            .request(reqwest::Method::HEAD, name)
            .send()
            .map_err(|e| BackendError::Request {
                operation: "exists",
                source: e,
            })?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(BackendError::Status {
                operation: "exists",
                status: status.as_u16(),
                body: String::new(),
            }),
        }
    }

    fn create_index(&self, index: &str, request: &CreateIndex) -> BackendResult<()> {
        let body = Self::json_body("create_index", request)?;
        let builder = self
            .request(reqwest::Method::PUT, index)
            .header("Content-Type", "application/json")
            .body(body);
        Self::send("create_index", builder)?;
        Ok(())
    }

    fn rollover(&self, alias: &str, request: &RolloverRequest) -> BackendResult<RolloverResponse> {
        let body = Self::json_body("rollover", request)?;
        let builder = self
            .request(reqwest::Method::POST, &format!("{alias}/_rollover"))
            .header("Content-Type", "application/json")
            .body(body);
        let response = Self::send("rollover", builder)?;
        Self::parse("rollover", response)
    }

    fn bulk(&self, operations: &[BulkOperation]) -> BackendResult<BulkResponse> {
        if operations.is_empty() {
            return Ok(BulkResponse::default());
        }

        let capacity = operations.iter().map(BulkOperation::estimated_size).sum();
        let mut body = Vec::with_capacity(capacity);
        for op in operations {
            op.write_ndjson(&mut body)?;
        }

        let builder = self
            .request(reqwest::Method::POST, "_bulk")
            .header("Content-Type", "application/x-ndjson")
            .body(body);
        let response = Self::send("bulk", builder)?;
        Self::parse("bulk", response)
    }

    fn search(&self, index: &str, request: &SearchRequest) -> BackendResult<SearchResponse> {
        let body = Self::json_body("search", request)?;
        let builder = self
            .request(reqwest::Method::POST, &format!("{index}/_search"))
            .header("Content-Type", "application/json")
            .body(body);

        match Self::send("search", builder) {
            Ok(response) => Self::parse("search", response),
            Err(BackendError::Status { status: 404, .. }) => Err(BackendError::IndexNotFound {
                name: index.to_string(),
            }),
            Err(BackendError::Status {
                status: 400, body, ..
            }) => Err(BackendError::InvalidQuery { reason: body }),
            Err(e) => Err(e),
        }
    }

    fn cluster_health(&self) -> BackendResult<ClusterHealth> {
        let response = Self::send(
            "cluster_health",
            self.request(reqwest::Method::GET, "_cluster/health"),
        )?;
        Self::parse("cluster_health", response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builders() {
        let config = ElasticConfig::new("http://es:9200/")
            .with_basic_auth("elastic", Some("secret".to_string()))
            .with_timeout(Duration::from_secs(5));
        assert_eq!(config.username.as_deref(), Some("elastic"));
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_base_url_trimmed() {
        let client = ElasticClient::new(ElasticConfig::new("http://es:9200/")).unwrap();
        assert_eq!(client.url(), "http://es:9200");
    }

    #[test]
    fn test_unreachable_cluster_is_request_error() {
        let client = ElasticClient::new(
            ElasticConfig::new("http://127.0.0.1:1").with_timeout(Duration::from_millis(200)),
        )
        .unwrap();
        let err = client.cluster_health().unwrap_err();
        assert!(matches!(
            err,
            BackendError::Request {
                operation: "cluster_health",
                ..
            }
        ));
    }

    #[test]
    fn test_empty_bulk_skips_request() {
        let client = ElasticClient::new(
            ElasticConfig::new("http://127.0.0.1:1").with_timeout(Duration::from_millis(200)),
        )
        .unwrap();
        let response = client.bulk(&[]).unwrap();
        assert!(response.items.is_empty());
    }
}
