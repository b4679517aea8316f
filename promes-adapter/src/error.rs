//! Error type for the adapter binary.

use std::net::SocketAddr;

use promes::PromesError;
use thiserror::Error;

/// Errors that stop the adapter.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// A library component failed to start or stop.
    #[error(transparent)]
    Promes(#[from] PromesError),

    /// The batcher collector could not be registered.
    #[error("failed to register metrics: {source}")]
    Registry {
        /// The underlying prometheus error.
        #[source]
        source: prometheus::Error,
    },

    /// The async runtime could not be built.
    #[error("failed to build runtime: {source}")]
    Runtime {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The listener could not bind.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The requested listen address.
        addr: SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The HTTP server stopped with an error.
    #[error("server error: {source}")]
    Serve {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}
