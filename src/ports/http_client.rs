use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

use crate::{config::models::HostClientConfig, ports::discovery::Instance};

/// Custom error type for upstream HTTP transport operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to the upstream instance fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when the exchange did not complete in time
    #[error("Timeout error after {0} ms")]
    Timeout(u64),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Upstream announced a body larger than the configured limit
    #[error("Response body of {actual} bytes exceeds limit of {limit} bytes")]
    ResponseTooLarge {
        /// Configured maximum
        limit: usize,
        /// Announced content length
        actual: u64,
    },

    /// No connection slot became free within the wait timeout
    #[error("No free connection to {addr} after waiting {waited_ms} ms")]
    PoolExhausted {
        /// Upstream address
        addr: String,
        /// How long the request waited
        waited_ms: u64,
    },

    /// The transport has been closed
    #[error("Transport to {0} is closed")]
    Closed(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HostTransport defines the port for exchanging requests with a single upstream instance
#[async_trait]
pub trait HostTransport: Send + Sync + 'static {
    /// `ip:port` of the instance this transport talks to
    fn addr(&self) -> &str;

    /// Forward a request to the instance.
    ///
    /// Only the path and query of the request URI are used; the transport
    /// supplies scheme and authority.
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;

    /// Close the transport. Idempotent; later sends fail with [`HttpClientError::Closed`].
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Builds one transport per discovered instance.
///
/// Construction is synchronous and cheap so it can run inside a discovery
/// watch callback.
pub trait TransportFactory: Send + Sync + 'static {
    fn create(
        &self,
        instance: &Instance,
        config: &HostClientConfig,
    ) -> HttpClientResult<Arc<dyn HostTransport>>;
}
