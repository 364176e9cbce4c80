//! Ordered resource lifecycle.
//!
//! Every long-lived component (servers, pools, registrations) is collected
//! into a [`Finalizer`] when it is created. On exit the finalizer disposes
//! them in reverse collection order under a single deadline, so a component
//! is always torn down before the things it was built on.
use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{sync::mpsc, time::Instant};

/// Error type for component teardown
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LifecycleError {
    /// The shutdown deadline passed
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Teardown was cancelled
    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),

    /// A named component failed
    #[error("{name}: {source}")]
    Component {
        name: String,
        source: Box<LifecycleError>,
    },

    #[error("{}", join_errors(.0))]
    Multiple(Vec<LifecycleError>),
}

fn join_errors(errors: &[LifecycleError]) -> String {
    let parts: Vec<String> = errors.iter().map(ToString::to_string).collect();
    parts.join("; ")
}

impl LifecycleError {
    pub fn failed(message: impl fmt::Display) -> Self {
        LifecycleError::Failed(message.to_string())
    }

    pub fn component(name: impl Into<String>, source: LifecycleError) -> Self {
        LifecycleError::Component {
            name: name.into(),
            source: Box::new(source),
        }
    }

    /// Whether the error means the rest of the teardown must be abandoned.
    pub fn is_abort(&self) -> bool {
        match self {
            LifecycleError::DeadlineExceeded | LifecycleError::Cancelled => true,
            LifecycleError::Component { source, .. } => source.is_abort(),
            LifecycleError::Multiple(errors) => errors.iter().any(LifecycleError::is_abort),
            LifecycleError::Failed(_) => false,
        }
    }

    /// Collapse a list of errors: none is `Ok`, one is itself, more is [`LifecycleError::Multiple`].
    pub fn from_errors(mut errors: Vec<LifecycleError>) -> Result<(), LifecycleError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(LifecycleError::Multiple(errors)),
        }
    }
}

/// Sink for errors raised asynchronously by running components.
///
/// Anything reported here makes the application exit.
#[derive(Clone, Debug)]
pub struct ErrorReporter {
    tx: mpsc::Sender<eyre::Report>,
}

impl ErrorReporter {
    /// Create a bounded reporter and the receiving end the composition root waits on.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<eyre::Report>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Report an error without blocking.
    pub fn report(&self, err: impl Into<eyre::Report>) {
        let err = err.into();
        if let Err(e) = self.tx.try_send(err) {
            tracing::warn!("Dropping reported error, channel unavailable: {}", e);
        }
    }
}

/// A component whose teardown is owned by the [`Finalizer`]
#[async_trait]
pub trait Lifecycle: Send + Sync + 'static {
    /// Called once, right after the component is collected.
    fn on_created(&self, _errors: ErrorReporter) {}

    /// Release the component's resources. Must give up once `deadline` passes.
    async fn on_dispose(&self, deadline: Instant) -> Result<(), LifecycleError>;
}

/// What a [`Finalizer::release`] run produced.
#[derive(Debug, Default)]
pub struct ReleaseOutcome {
    pub errors: Vec<LifecycleError>,
    /// Set when remaining components were skipped
    pub aborted: bool,
}

impl ReleaseOutcome {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && !self.aborted
    }
}

struct LifecycleEntry {
    key: String,
    resource: Arc<dyn Lifecycle>,
}

/// Collected components; `released` flips under the same lock so a component
/// is either in the release snapshot or rejected.
#[derive(Default)]
struct Entries {
    keys: HashSet<String>,
    ordered: Vec<LifecycleEntry>,
    released: bool,
}

/// Collects lifecycle components and releases them LIFO
pub struct Finalizer {
    entries: Mutex<Entries>,
    reporter: ErrorReporter,
}

impl Finalizer {
    pub fn new(reporter: ErrorReporter) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            reporter,
        }
    }

    /// Register a component under `key`.
    ///
    /// Returns `false` without touching the component when the key is taken or
    /// release already started.
    pub fn collect(&self, key: impl Into<String>, resource: Arc<dyn Lifecycle>) -> bool {
        let key = key.into();
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if entries.released {
                tracing::warn!("Finalizer already released, ignoring component {}", key);
                return false;
            }
            if !entries.keys.insert(key.clone()) {
                tracing::debug!("Component {} already collected", key);
                return false;
            }
            entries.ordered.push(LifecycleEntry {
                key: key.clone(),
                resource: resource.clone(),
            });
        }

        tracing::debug!("Collected component {}", key);
        resource.on_created(self.reporter.clone());
        true
    }

    /// Build and register a component only if `key` is not collected yet.
    ///
    /// A build error is sent to the error reporter and nothing is collected.
    pub fn collect_lazy<F>(&self, key: impl Into<String>, build: F) -> bool
    where
        F: FnOnce(ErrorReporter) -> eyre::Result<Arc<dyn Lifecycle>>,
    {
        let key = key.into();
        if self.contains(&key) {
            return false;
        }

        match build(self.reporter.clone()) {
            Ok(resource) => self.collect(key, resource),
            Err(e) => {
                tracing::error!("Failed to build component {}: {:?}", key, e);
                self.reporter.report(e.wrap_err(format!("building {key} failed")));
                false
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys
            .contains(key)
    }

    /// Collected keys in collection order.
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .ordered
            .iter()
            .map(|entry| entry.key.clone())
            .collect()
    }

    pub fn is_released(&self) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .released
    }

    /// Dispose every component in reverse collection order.
    ///
    /// Runs at most once; later calls return an empty outcome. Stops early
    /// when the deadline passes or a component reports an abort error.
    pub async fn release(&self, deadline: Instant) -> ReleaseOutcome {
        let mut outcome = ReleaseOutcome::default();
        let entries: Vec<(String, Arc<dyn Lifecycle>)> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if entries.released {
                tracing::debug!("Finalizer release already ran");
                return outcome;
            }
            entries.released = true;
            entries
                .ordered
                .iter()
                .map(|entry| (entry.key.clone(), entry.resource.clone()))
                .collect()
        };

        tracing::info!("Releasing {} components", entries.len());

        for (key, resource) in entries.into_iter().rev() {
            if Instant::now() >= deadline {
                tracing::warn!("Deadline passed before disposing {}, aborting release", key);
                outcome.errors.push(LifecycleError::DeadlineExceeded);
                outcome.aborted = true;
                return outcome;
            }

            let result = match tokio::time::timeout_at(deadline, resource.on_dispose(deadline)).await
            {
                Ok(result) => result,
                Err(_) => Err(LifecycleError::DeadlineExceeded),
            };

            match result {
                Ok(()) => tracing::info!("Component {} disposed", key),
                Err(err) => {
                    let abort = err.is_abort();
                    tracing::error!("Component {} dispose failed: {}", key, err);
                    outcome.errors.push(LifecycleError::component(key, err));
                    if abort {
                        outcome.aborted = true;
                        return outcome;
                    }
                }
            }
        }

        outcome
    }
}
