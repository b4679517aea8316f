//! Error types for the promes adapter core.

use thiserror::Error;

/// The main error type for all promes operations.
///
/// This enum covers every failure the core can surface, from configuration
/// validation at construction time to backend failures on the read path.
/// Write-path flush failures never reach callers; they are logged and
/// counted instead.
#[derive(Error, Debug)]
pub enum PromesError {
    /// Invalid component configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error talking to the document store.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Error in the write batcher lifecycle.
    #[error("batcher error: {0}")]
    Batcher(#[from] BatcherError),

    /// Error translating or executing a read query.
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// Error managing index templates and rollover.
    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Error decoding or encoding the remote protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Error building metric descriptors.
    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),
}

impl PromesError {
    /// Returns `true` for conditions that signal a protocol or version
    /// mismatch, or a startup failure the process must not continue past.
    ///
    /// Fatal errors are distinguished so callers can abort deterministically
    /// instead of treating them as bad data.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Query(QueryError::UnknownMatcher { .. })
                | Self::Lifecycle(LifecycleError::Bootstrap { .. })
        )
    }
}

/// Errors raised while validating configuration values.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An index or alias name is empty or not a legal index name.
    #[error("invalid index name '{name}': {reason}")]
    InvalidIndexName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A numeric setting is outside its allowed range.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// The configuration field.
        field: &'static str,
        /// Why the value is invalid.
        reason: String,
    },

    /// A human-readable duration could not be parsed.
    #[error("invalid duration '{input}': {reason}")]
    InvalidDuration {
        /// The rejected input.
        input: String,
        /// Why it could not be parsed.
        reason: String,
    },

    /// A human-readable byte size could not be parsed.
    #[error("invalid byte size '{input}': {reason}")]
    InvalidByteSize {
        /// The rejected input.
        input: String,
        /// Why it could not be parsed.
        reason: String,
    },
}

/// Errors returned by a [`DocumentStore`](crate::backend::DocumentStore).
#[derive(Error, Debug)]
pub enum BackendError {
    /// Failed to build the HTTP client.
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The request could not be sent or the response could not be read.
    #[error("{operation} request failed: {source}")]
    Request {
        /// The backend operation being attempted.
        operation: &'static str,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The backend answered with a non-success status.
    #[error("{operation} returned status {status}: {body}")]
    Status {
        /// The backend operation being attempted.
        operation: &'static str,
        /// The HTTP status code.
        status: u16,
        /// The response body text.
        body: String,
    },

    /// A request or response body could not be (de)serialized.
    #[error("{operation} body could not be processed: {source}")]
    Serde {
        /// The backend operation being attempted.
        operation: &'static str,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A query was rejected by the backend as malformed.
    #[error("invalid query: {reason}")]
    InvalidQuery {
        /// Why the query is invalid.
        reason: String,
    },

    /// The named index or alias does not exist.
    #[error("no such index or alias: {name}")]
    IndexNotFound {
        /// The missing name.
        name: String,
    },

    /// The backend is not reachable.
    #[error("backend unavailable: {reason}")]
    Unavailable {
        /// Description of the outage.
        reason: String,
    },
}

/// Errors from the write batcher lifecycle.
#[derive(Error, Debug)]
pub enum BatcherError {
    /// A worker thread could not be spawned.
    #[error("failed to spawn flush worker {worker}: {source}")]
    Spawn {
        /// The worker index.
        worker: usize,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A worker thread panicked before finishing its final flush.
    #[error("flush worker {worker} panicked")]
    WorkerPanicked {
        /// The worker index.
        worker: usize,
    },
}

/// Errors that can occur while translating or executing read queries.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The matcher type is not one this adapter understands.
    ///
    /// The matcher enum is versioned with the wire protocol, so an unknown
    /// value means client and adapter disagree on the protocol version.
    #[error("unknown label matcher type {code} for label '{name}'")]
    UnknownMatcher {
        /// The raw matcher type code.
        code: i32,
        /// The label the matcher applied to.
        name: String,
    },

    /// The time range is inverted.
    #[error("invalid time range: start {start} > end {end}")]
    InvalidTimeRange {
        /// The start time in epoch milliseconds.
        start: i64,
        /// The end time in epoch milliseconds.
        end: i64,
    },

    /// A search hit did not decode as a sample document.
    #[error("hit {id} is not a sample document: {source}")]
    MalformedHit {
        /// The backend document id.
        id: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised by the index lifecycle manager.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Template registration or initial index creation failed.
    ///
    /// The adapter must not accept writes against an unmapped alias.
    #[error("bootstrap of alias '{alias}' failed at {step}: {source}")]
    Bootstrap {
        /// The write alias being bootstrapped.
        alias: String,
        /// Which bootstrap step failed.
        step: &'static str,
        /// The backend failure.
        #[source]
        source: BackendError,
    },

    /// The rollover thread could not be spawned.
    #[error("failed to spawn rollover task: {source}")]
    Spawn {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors that can occur while decoding or encoding the remote protocol.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The body is not valid snappy.
    #[error("failed to decompress body: {source}")]
    Decompression {
        /// The snappy error.
        #[source]
        source: snap::Error,
    },

    /// Failed to compress a response body.
    #[error("failed to compress body: {source}")]
    Compression {
        /// The snappy error.
        #[source]
        source: snap::Error,
    },

    /// The body is not a valid protobuf message.
    #[error("failed to decode {message}: {source}")]
    Decode {
        /// The message type being decoded.
        message: &'static str,
        /// The protobuf decoding error.
        #[source]
        source: prost::DecodeError,
    },

    /// Failed to serialize a protobuf message.
    #[error("failed to encode {message}: {source}")]
    Encode {
        /// The message type being encoded.
        message: &'static str,
        /// The protobuf encoding error.
        #[source]
        source: prost::EncodeError,
    },
}

/// Errors building the metrics collector.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// A metric descriptor was rejected.
    #[error("invalid metric descriptor: {source}")]
    Descriptor {
        /// The prometheus error.
        #[source]
        source: prometheus::Error,
    },
}

/// Type alias for `Result<T, PromesError>`.
pub type Result<T> = std::result::Result<T, PromesError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_matcher_is_fatal() {
        let err: PromesError = QueryError::UnknownMatcher {
            code: 7,
            name: "job".to_string(),
        }
        .into();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("unknown label matcher type 7"));
    }

    #[test]
    fn test_backend_errors_are_not_fatal() {
        let err: PromesError = BackendError::Unavailable {
            reason: "connection refused".to_string(),
        }
        .into();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_bootstrap_error_is_fatal() {
        let err: PromesError = LifecycleError::Bootstrap {
            alias: "prom-metrics".to_string(),
            step: "template",
            source: BackendError::Unavailable {
                reason: "down".to_string(),
            },
        }
        .into();
        assert!(err.is_fatal());
    }
}
