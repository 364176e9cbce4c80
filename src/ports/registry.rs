use std::collections::HashMap;

use async_trait::async_trait;

use crate::ports::discovery::{DiscoveryExtra, DiscoveryResult};

/// Parameters for announcing a local instance.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterParam {
    pub service_name: String,
    /// `ip:port` the instance is reachable on
    pub addr: String,
    pub weight: f64,
    pub metadata: HashMap<String, String>,
    pub extra: DiscoveryExtra,
}

/// Parameters for withdrawing a previously registered instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeregisterParam {
    pub service_name: String,
    pub addr: String,
    pub extra: DiscoveryExtra,
}

impl From<&RegisterParam> for DeregisterParam {
    fn from(param: &RegisterParam) -> Self {
        Self {
            service_name: param.service_name.clone(),
            addr: param.addr.clone(),
            extra: param.extra.clone(),
        }
    }
}

/// Registry defines the port for publishing instances to the discovery provider
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    async fn register(&self, param: &RegisterParam) -> DiscoveryResult<()>;
    async fn deregister(&self, param: &DeregisterParam) -> DiscoveryResult<()>;
}
