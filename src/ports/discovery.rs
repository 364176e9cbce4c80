use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for discovery and registry operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DiscoveryError {
    /// The discovery provider could not be reached
    #[error("Discovery provider unreachable: {0}")]
    Unreachable(String),

    /// The provider does not know the requested service
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// The request parameters were rejected
    #[error("Invalid discovery parameter: {0}")]
    InvalidParam(String),

    /// Unwatch was called with an id the provider never issued
    #[error("No watch {id} registered for service {service}")]
    WatchNotFound {
        /// Service the watch was registered for
        service: String,
        /// Id returned by `watch`
        id: u64,
    },
}

/// Result type alias for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Which port of an instance the caller is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    #[default]
    Http,
    Rpc,
}

/// Provider-specific scoping decoded once at the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct DiscoveryExtra {
    pub cluster_name: String,
    pub group_name: String,
}

/// Parameters of a discover/watch/unwatch call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoverParam {
    pub service_name: String,
    pub kind: DiscoveryKind,
    pub extra: DiscoveryExtra,
}

impl DiscoverParam {
    pub fn new(service_name: impl Into<String>, kind: DiscoveryKind, extra: DiscoveryExtra) -> Self {
        Self {
            service_name: service_name.into(),
            kind,
            extra,
        }
    }
}

fn default_weight() -> f64 {
    1.0
}

/// A single reachable endpoint of a service.
///
/// Instances are delivered as whole snapshots and never mutated in place; the
/// `ip:port` identity is the only key used to compare two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub service_name: String,
    pub ip: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Instance {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            instance_id: String::new(),
            service_name: String::new(),
            ip: ip.into(),
            port,
            weight: default_weight(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_service(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// `ip:port`, the identity used for reconciliation.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Render a snapshot as a compact list of identities for log lines.
pub fn pretty_instances(instances: &[Instance]) -> String {
    let ids: Vec<String> = instances.iter().map(Instance::identity).collect();
    format!("[{}]", ids.join(", "))
}

/// Handle returned by [`Discovery::watch`], needed to unwatch later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

/// Callback invoked with every full snapshot (or provider error) for a watched service.
pub type WatchCallback = Arc<dyn Fn(DiscoveryResult<Vec<Instance>>) + Send + Sync>;

/// Discovery defines the port (interface) for looking up and watching service instances
#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Return the current snapshot of a service.
    async fn discover(&self, param: &DiscoverParam) -> DiscoveryResult<Vec<Instance>>;

    /// Subscribe to snapshots of a service.
    ///
    /// The callback runs on the provider's delivery thread and must not block.
    async fn watch(&self, param: &DiscoverParam, callback: WatchCallback) -> DiscoveryResult<WatchId>;

    /// Cancel a subscription made with [`Discovery::watch`].
    async fn unwatch(&self, param: &DiscoverParam, id: WatchId) -> DiscoveryResult<()>;
}
