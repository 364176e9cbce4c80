use std::sync::Arc;

use crate::config::models::{DynamicConfig, RouterTableConfig};

/// Data id of the routing-table document
pub const ROUTER_TABLE_DATA_ID: &str = "router-tables.json";
/// Data id of the static application document
pub const STATIC_CONFIG_DATA_ID: &str = "static-config.yaml";
/// Data id of the runtime-tunable document
pub const DYNAMIC_CONFIG_DATA_ID: &str = "dynamic-config.yaml";

/// Latest decoded value of a configuration document.
#[derive(Debug, Clone)]
pub enum ConfigValue {
    RouterTable(Arc<RouterTableConfig>),
    Dynamic(Arc<DynamicConfig>),
    /// Documents without a typed decoder are kept verbatim
    Text(Arc<str>),
}

/// ConfigurationReceiver defines the port a configuration center delivers documents to
pub trait ConfigurationReceiver: Send + Sync + 'static {
    /// A document that is read once at boot.
    fn on_receive_static(&self, data_id: &str, group: &str, payload: &str);

    /// A document that may change at runtime; `first_load` is set for the boot delivery.
    fn on_receive_dynamic(&self, data_id: &str, group: &str, payload: &str, first_load: bool);

    /// The value most recently received for `data_id`.
    fn recently_configure(&self, data_id: &str) -> Option<ConfigValue>;
}
