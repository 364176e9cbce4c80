use std::sync::Arc;

use eyre::Result;
use scc::HashMap;

use crate::{
    config::loader::{parse_dynamic_config, parse_router_table},
    ports::config_provider::{
        ConfigValue, ConfigurationReceiver, DYNAMIC_CONFIG_DATA_ID, ROUTER_TABLE_DATA_ID,
    },
    tracing_setup::LogLevelHandle,
    utils::observer::ObserverRegistry,
};

/// Latest decoded value per data id
#[derive(Default)]
pub struct ConfigStore {
    values: HashMap<String, ConfigValue>,
}

impl ConfigStore {
    pub fn get(&self, data_id: &str) -> Option<ConfigValue> {
        self.values.read_sync(data_id, |_, value| value.clone())
    }

    pub fn put(&self, data_id: &str, value: ConfigValue) {
        self.values.upsert_sync(data_id.to_string(), value);
    }
}

/// Decodes gateway documents, keeps them and fans them out to observers.
///
/// A document that fails to decode is logged and the previous value stays.
pub struct GatewayConfigurationReceiver {
    store: ConfigStore,
    observers: Arc<ObserverRegistry>,
    log_levels: Option<LogLevelHandle>,
}

impl GatewayConfigurationReceiver {
    pub fn new(observers: Arc<ObserverRegistry>, log_levels: Option<LogLevelHandle>) -> Self {
        Self {
            store: ConfigStore::default(),
            observers,
            log_levels,
        }
    }

    fn decode(data_id: &str, payload: &str) -> Result<ConfigValue> {
        Ok(match data_id {
            ROUTER_TABLE_DATA_ID => ConfigValue::RouterTable(Arc::new(parse_router_table(payload)?)),
            DYNAMIC_CONFIG_DATA_ID => ConfigValue::Dynamic(Arc::new(parse_dynamic_config(payload)?)),
            _ => ConfigValue::Text(Arc::from(payload)),
        })
    }

    fn accept(&self, data_id: &str, group: &str, payload: &str) -> Option<ConfigValue> {
        match Self::decode(data_id, payload) {
            Ok(value) => {
                self.store.put(data_id, value.clone());
                Some(value)
            }
            Err(e) => {
                tracing::error!("Discarding {} ({}): {:?}", data_id, group, e);
                None
            }
        }
    }

    fn apply_log_levels(&self, value: &ConfigValue) {
        let (Some(handle), ConfigValue::Dynamic(dynamic)) = (&self.log_levels, value) else {
            return;
        };
        if let Err(e) = handle.set_module_levels(&dynamic.log_level) {
            tracing::error!("Failed to apply log levels: {:?}", e);
        }
    }
}

impl ConfigurationReceiver for GatewayConfigurationReceiver {
    fn on_receive_static(&self, data_id: &str, group: &str, payload: &str) {
        tracing::info!("Received static config {} ({})", data_id, group);
        if let Some(value) = self.accept(data_id, group, payload) {
            self.apply_log_levels(&value);
        }
    }

    fn on_receive_dynamic(&self, data_id: &str, group: &str, payload: &str, first_load: bool) {
        tracing::info!(
            "Received dynamic config {} ({}), first load: {}",
            data_id,
            group,
            first_load
        );
        let Some(value) = self.accept(data_id, group, payload) else {
            return;
        };
        self.apply_log_levels(&value);
        let notified = self.observers.notify(data_id, &value);
        tracing::debug!("{} observers notified of {}", notified, data_id);
    }

    fn recently_configure(&self, data_id: &str) -> Option<ConfigValue> {
        self.store.get(data_id)
    }
}
