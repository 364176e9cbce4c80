use std::sync::Arc;

use scc::HashMap;

use crate::ports::config_provider::ConfigValue;

/// Callback run for every new value of a data id.
pub type Observer = Arc<dyn Fn(&ConfigValue) + Send + Sync>;

/// Observers of configuration data ids, owned by the composition root
#[derive(Default)]
pub struct ObserverRegistry {
    observers: HashMap<String, Vec<Observer>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_observer(&self, data_id: impl Into<String>, observer: Observer) {
        let data_id = data_id.into();
        tracing::debug!("Registering observer for {}", data_id);
        self.observers
            .entry_sync(data_id)
            .or_default()
            .get_mut()
            .push(observer);
    }

    /// Run every observer of `data_id` with `value`; returns how many ran.
    ///
    /// Observers run after the entry is released, so they may register
    /// further observers.
    pub fn notify(&self, data_id: &str, value: &ConfigValue) -> usize {
        let observers: Vec<Observer> = self
            .observers
            .read_sync(data_id, |_, observers| observers.clone())
            .unwrap_or_default();

        for observer in &observers {
            observer(value);
        }
        observers.len()
    }

    pub fn observer_count(&self, data_id: &str) -> usize {
        self.observers
            .read_sync(data_id, |_, observers| observers.len())
            .unwrap_or(0)
    }

    pub fn unregister_all(&self) {
        self.observers.clear_sync();
    }
}
