use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

use crate::ports::{http_client::HttpClientError, rpc::RpcError};

/// Error type for gateway request handling
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    /// The upstream service has no live instance
    #[error("Service {0} unavailable")]
    Unavailable(String),
    #[error("Gateway timeout: {0}")]
    GatewayTimeout(String),
    #[error("Bad gateway: {0}")]
    BadGateway(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    /// A modifier's RPC call failed
    #[error("Rpc call failed: {0}")]
    Rpc(#[from] RpcError),
    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl From<HttpClientError> for GatewayError {
    fn from(err: HttpClientError) -> Self {
        match err {
            HttpClientError::Timeout(_) => GatewayError::GatewayTimeout(err.to_string()),
            HttpClientError::InvalidRequest(_) => GatewayError::BadRequest(err.to_string()),
            other => GatewayError::BadGateway(other.to_string()),
        }
    }
}

/// Routing metadata attached to a request by the path-rewrite handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteMeta {
    /// Id of the routing-table entry that matched
    pub service_id: String,
    /// Path after the rewrite
    pub routed_path: String,
    /// 32 hex characters
    pub request_id: String,
}

/// What a response modifier may inspect about the exchange.
#[derive(Debug, Clone, Copy)]
pub struct ResponseContext<'a> {
    pub service_name: &'a str,
    pub route: Option<&'a RouteMeta>,
}

/// Mutates a request before it is forwarded upstream
#[async_trait]
pub trait RequestModifier: Send + Sync + 'static {
    async fn modify_request(&self, req: &mut Request<AxumBody>) -> Result<(), GatewayError>;
}

/// Mutates an upstream response before it is returned to the client
#[async_trait]
pub trait ResponseModifier: Send + Sync + 'static {
    async fn modify_response(
        &self,
        ctx: &ResponseContext<'_>,
        resp: &mut Response<AxumBody>,
    ) -> Result<(), GatewayError>;
}

/// RequestHandler defines the port for a routed endpoint of the dispatcher
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, req: Request<AxumBody>) -> Result<Response<AxumBody>, GatewayError>;
}

/// Turns a handler error into the response sent to the client.
pub type ErrorResponder = Arc<dyn Fn(&GatewayError) -> Response<AxumBody> + Send + Sync>;
