use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ports::discovery::{DiscoveryError, Instance};

/// Error type for RPC client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RpcError {
    /// The pool never completed its first discovery
    #[error("Rpc client for {service} is not ready: {source}")]
    NotReady {
        service: String,
        #[source]
        source: DiscoveryError,
    },

    /// The pool has no live connection
    #[error("No available instance of {service}")]
    NoInstance { service: String },

    /// The call did not complete in time
    #[error("Rpc call timed out after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the call
    #[error("Rpc call cancelled")]
    Cancelled,

    /// The remote answered with a business error
    #[error("Remote error {code}: {desc}")]
    Remote {
        code: String,
        desc: String,
        msg: String,
    },

    /// Dialing or framing failed
    #[error("Rpc transport error: {0}")]
    Transport(String),

    /// Request or reply could not be (de)serialized
    #[error("Rpc codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The connection or pool has been closed
    #[error("Rpc client is closed")]
    Closed,

    /// Empty or malformed service name
    #[error("Invalid service name: {0:?}")]
    InvalidServiceName(String),
}

impl RpcError {
    /// Whether the error came from a timeout rather than a remote or transport failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout(_))
    }
}

/// Result type alias for RPC operations
pub type RpcResult<T> = Result<T, RpcError>;

/// Handler invoked once with the reply of an asynchronous call.
pub type AsyncReplyHandler = Box<dyn FnOnce(RpcResult<Value>) + Send + 'static>;

/// A one-way message pushed to a connected peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    pub method: String,
    pub payload: Value,
}

impl RpcMessage {
    pub fn new(method: impl Into<String>, payload: Value) -> Self {
        Self {
            method: method.into(),
            payload,
        }
    }
}

/// RpcConnection defines the port for one live connection of the RPC transport library
#[async_trait]
pub trait RpcConnection: Send + Sync + 'static {
    async fn call(&self, method: &str, req: Value, timeout: Duration) -> RpcResult<Value>;

    /// Send a request and return once it is written; `handler` receives the reply.
    async fn call_async(
        &self,
        method: &str,
        req: Value,
        handler: AsyncReplyHandler,
        timeout: Duration,
    ) -> RpcResult<()>;

    async fn notify(&self, method: &str, data: Value, timeout: Duration) -> RpcResult<()>;

    async fn push_msg(&self, msg: RpcMessage, timeout: Duration) -> RpcResult<()>;

    fn close(&self);
}

/// RpcConnector dials connections to discovered instances
#[async_trait]
pub trait RpcConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        instance: &Instance,
        dial_timeout: Duration,
    ) -> RpcResult<Arc<dyn RpcConnection>>;
}
