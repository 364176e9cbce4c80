use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use eyre::{Context, Result};
use notify::{RecursiveMode, Watcher};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};

use crate::{
    core::lifecycle::{Lifecycle, LifecycleError},
    ports::config_provider::{ConfigurationReceiver, DYNAMIC_CONFIG_DATA_ID, ROUTER_TABLE_DATA_ID},
};

/// Group reported for documents read from local files
pub const FILE_GROUP: &str = "LOCAL_FILE";

const DEBOUNCE: Duration = Duration::from_millis(100);

/// Feeds a local file to a [`ConfigurationReceiver`] and re-delivers it on change.
pub struct FileConfigProvider {
    path: PathBuf,
    data_id: &'static str,
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FileConfigProvider {
    /// Watch the routing-table document at `path`.
    pub async fn routing_table(
        path: impl Into<PathBuf>,
        receiver: Arc<dyn ConfigurationReceiver>,
    ) -> Result<Arc<Self>> {
        Self::start(path.into(), ROUTER_TABLE_DATA_ID, receiver).await
    }

    /// Watch the runtime-tunable YAML document at `path`.
    pub async fn dynamic_config(
        path: impl Into<PathBuf>,
        receiver: Arc<dyn ConfigurationReceiver>,
    ) -> Result<Arc<Self>> {
        Self::start(path.into(), DYNAMIC_CONFIG_DATA_ID, receiver).await
    }

    /// Deliver the file once as a first load, then watch its directory.
    async fn start(
        path: PathBuf,
        data_id: &'static str,
        receiver: Arc<dyn ConfigurationReceiver>,
    ) -> Result<Arc<Self>> {
        let payload = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        receiver.on_receive_dynamic(data_id, FILE_GROUP, &payload, true);

        let (tx, rx) = mpsc::channel(1);
        let watcher = watch_file(&path, tx)?;
        let task = tokio::spawn(redeliver(path.clone(), data_id, receiver, rx));

        tracing::info!("Watching {} as {}", path.display(), data_id);
        Ok(Arc::new(Self {
            path,
            data_id,
            watcher: Mutex::new(Some(watcher)),
            task: Mutex::new(Some(task)),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data_id(&self) -> &str {
        self.data_id
    }

    /// Stop watching; idempotent.
    pub fn stop(&self) {
        let watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
        }
        if watcher.is_some() {
            tracing::info!("Stopped watching {}", self.path.display());
        }
    }
}

fn watch_file(path: &Path, tx: mpsc::Sender<()>) -> Result<notify::RecommendedWatcher> {
    let file_name = path
        .file_name()
        .ok_or_else(|| eyre::eyre!("Invalid config path {}", path.display()))?
        .to_owned();

    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                if (event.kind.is_modify() || event.kind.is_create())
                    && event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(&file_name))
                {
                    tracing::debug!("Config file changed: {:?}", event.kind);
                    let _ = tx.try_send(());
                }
            }
            Err(e) => tracing::error!("File watch error: {:?}", e),
        })?;

    let watch_dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    watcher
        .watch(watch_dir, RecursiveMode::NonRecursive)
        .wrap_err("Failed to watch config directory")?;
    Ok(watcher)
}

async fn redeliver(
    path: PathBuf,
    data_id: &'static str,
    receiver: Arc<dyn ConfigurationReceiver>,
    mut rx: mpsc::Receiver<()>,
) {
    let mut last: Option<String> = None;
    while rx.recv().await.is_some() {
        // editors emit bursts of events for a single save
        tokio::time::sleep(DEBOUNCE).await;
        while rx.try_recv().is_ok() {}

        match tokio::fs::read_to_string(&path).await {
            Ok(payload) => {
                if last.as_deref() == Some(payload.as_str()) {
                    continue;
                }
                receiver.on_receive_dynamic(data_id, FILE_GROUP, &payload, false);
                last = Some(payload);
            }
            Err(e) => tracing::warn!("Failed to re-read {}: {}", path.display(), e),
        }
    }
}

#[async_trait]
impl Lifecycle for FileConfigProvider {
    async fn on_dispose(&self, _deadline: Instant) -> Result<(), LifecycleError> {
        self.stop();
        Ok(())
    }
}
