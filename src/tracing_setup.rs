use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use eyre::{Result, WrapErr, eyre};
use tracing_subscriber::{
    EnvFilter, Registry, filter::LevelFilter, layer::SubscriberExt, reload,
    util::SubscriberInitExt,
};

use crate::config::models::LogConfig;

/// Changes the log filter of the running process.
#[derive(Clone)]
pub struct LogLevelHandle {
    base: String,
    current: Arc<Mutex<String>>,
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogLevelHandle {
    fn new(base: String, handle: reload::Handle<EnvFilter, Registry>) -> Self {
        Self {
            current: Arc::new(Mutex::new(base.clone())),
            base,
            handle,
        }
    }

    /// The directive string currently installed.
    pub fn current(&self) -> String {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the per-module levels on top of the boot-time filter.
    ///
    /// Entries with an unknown level are skipped.
    pub fn set_module_levels(&self, levels: &HashMap<String, String>) -> Result<()> {
        let directives = build_directives(&self.base, levels);
        let filter = EnvFilter::try_new(&directives)
            .wrap_err_with(|| format!("Invalid log directives: {directives}"))?;
        self.handle
            .reload(filter)
            .map_err(|e| eyre!("Failed to reload log filter: {e}"))?;

        tracing::info!("Log filter set to {}", directives);
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = directives;
        Ok(())
    }
}

/// `base` followed by one `module=level` directive per entry, sorted by module.
pub fn build_directives(base: &str, levels: &HashMap<String, String>) -> String {
    let sorted: BTreeMap<&String, &String> = levels.iter().collect();
    let mut directives = base.to_string();
    for (module, level) in sorted {
        let module = module.trim();
        if module.is_empty() || level.trim().parse::<LevelFilter>().is_err() {
            tracing::warn!("Ignoring log level {:?} for module {:?}", level, module);
            continue;
        }
        if !directives.is_empty() {
            directives.push(',');
        }
        directives.push_str(module);
        directives.push('=');
        directives.push_str(&level.trim().to_ascii_lowercase());
    }
    directives
}

/// Initialize logging from configuration.
///
/// `RUST_LOG`, when set, takes precedence over `config.level`. The returned
/// handle changes levels at runtime.
pub fn init_tracing(config: &LogConfig) -> Result<LogLevelHandle> {
    let base = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| config.level.clone());
    let env_filter =
        EnvFilter::try_new(&base).wrap_err_with(|| format!("Invalid log level: {base}"))?;
    let (filter, handle) = reload::Layer::new(env_filter);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if config.json {
        Registry::default()
            .with(filter)
            .with(fmt_layer.json().with_current_span(false).with_span_list(true))
            .try_init()
            .wrap_err("Failed to install tracing subscriber")?;
    } else {
        Registry::default()
            .with(filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
            .wrap_err("Failed to install tracing subscriber")?;
    }

    tracing::info!("Gantry logging initialized with {} (json: {})", base, config.json);
    Ok(LogLevelHandle::new(base, handle))
}

/// A handle driving a subscriber that is not installed globally.
#[cfg(test)]
pub(crate) fn test_handle(base: &str) -> (LogLevelHandle, impl tracing::Subscriber + Send + Sync) {
    let (filter, handle) = reload::Layer::new(EnvFilter::new(base));
    let subscriber = Registry::default().with(filter);
    (LogLevelHandle::new(base.to_string(), handle), subscriber)
}
