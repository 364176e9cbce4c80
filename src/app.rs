//! Composition root: owns the finalizer, the error channel, the observer
//! registry and the shutdown sequence of a gantry process.
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::future::BoxFuture;
use tokio::{
    sync::{Mutex as TokioMutex, mpsc},
    time::Instant,
};

use crate::{
    config::models::{AppConfig, Profile},
    core::lifecycle::{ErrorReporter, Finalizer, Lifecycle, ReleaseOutcome},
    utils::{graceful_shutdown::{GracefulShutdown, ShutdownReason}, observer::ObserverRegistry},
};

const ERROR_CHANNEL_CAPACITY: usize = 16;

/// Work run around the finalizer release; receives the shared deadline.
pub type Hook = Box<dyn FnOnce(Instant) -> BoxFuture<'static, eyre::Result<()>> + Send>;

/// Why [`AppContext::wait_for_exit`] returned
#[derive(Debug)]
pub enum ExitReason {
    Signal(ShutdownReason),
    Error(eyre::Report),
}

/// Everything that went wrong while shutting down
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub hook_errors: Vec<String>,
    pub release: ReleaseOutcome,
    pub post_hooks_skipped: bool,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.hook_errors.is_empty() && self.release.is_clean() && !self.post_hooks_skipped
    }
}

pub struct AppContext {
    name: String,
    profile: Profile,
    graceful_exit_timeout: Duration,
    finalizer: Finalizer,
    reporter: ErrorReporter,
    errors: TokioMutex<mpsc::Receiver<eyre::Report>>,
    observers: Arc<ObserverRegistry>,
    shutdown: GracefulShutdown,
    pre_hooks: Mutex<Vec<(String, Hook)>>,
    post_hooks: Mutex<Vec<(String, Hook)>>,
}

impl AppContext {
    pub fn new(config: &AppConfig) -> Self {
        let (reporter, errors) = ErrorReporter::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            name: config.name.clone(),
            profile: config.profile,
            graceful_exit_timeout: config.graceful_exit_timeout(),
            finalizer: Finalizer::new(reporter.clone()),
            reporter,
            errors: TokioMutex::new(errors),
            observers: Arc::new(ObserverRegistry::new()),
            shutdown: GracefulShutdown::new(),
            pre_hooks: Mutex::new(Vec::new()),
            post_hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    pub fn reporter(&self) -> ErrorReporter {
        self.reporter.clone()
    }

    pub fn observers(&self) -> Arc<ObserverRegistry> {
        self.observers.clone()
    }

    pub fn finalizer(&self) -> &Finalizer {
        &self.finalizer
    }

    pub fn graceful_shutdown(&self) -> &GracefulShutdown {
        &self.shutdown
    }

    /// Hand `resource` to the finalizer; see [`Finalizer::collect`].
    pub fn collect(&self, key: impl Into<String>, resource: Arc<dyn Lifecycle>) -> bool {
        self.finalizer.collect(key, resource)
    }

    /// Run `hook` before the finalizer releases anything.
    pub fn add_pre_hook(&self, name: impl Into<String>, hook: Hook) {
        self.pre_hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.into(), hook));
    }

    /// Run `hook` after a release that was not aborted.
    pub fn add_post_hook(&self, name: impl Into<String>, hook: Hook) {
        self.post_hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.into(), hook));
    }

    /// Block until an OS signal, a manual shutdown request or a reported error.
    pub async fn wait_for_exit(&self) -> ExitReason {
        let mut errors = self.errors.lock().await;
        let reason = tokio::select! {
            Some(report) = errors.recv() => ExitReason::Error(report),
            reason = self.shutdown.wait_for_shutdown_signal() => ExitReason::Signal(reason),
            result = self.shutdown.run_signal_handler() => match result {
                Ok(reason) => ExitReason::Signal(reason),
                Err(e) => ExitReason::Error(e.wrap_err("installing signal handlers failed")),
            },
        };
        match &reason {
            ExitReason::Signal(signal) => tracing::info!("{} exiting on {:?}", self.name, signal),
            ExitReason::Error(e) => tracing::error!("{} exiting on error: {:?}", self.name, e),
        }
        reason
    }

    /// Pre-hooks, finalizer release, then post-hooks, all under one deadline.
    ///
    /// Hooks run once; a later call only returns what is left to do.
    pub async fn shutdown(&self) -> ShutdownReport {
        let deadline = Instant::now() + self.graceful_exit_timeout;
        let mut report = ShutdownReport::default();
        tracing::info!(
            "Shutting down {} within {:?}",
            self.name,
            self.graceful_exit_timeout
        );

        let pre_hooks = std::mem::take(&mut *self.pre_hooks.lock().unwrap_or_else(|e| e.into_inner()));
        run_hooks("pre", pre_hooks, deadline, &mut report.hook_errors).await;

        report.release = self.finalizer.release(deadline).await;

        let post_hooks =
            std::mem::take(&mut *self.post_hooks.lock().unwrap_or_else(|e| e.into_inner()));
        if report.release.aborted {
            report.post_hooks_skipped = !post_hooks.is_empty();
            tracing::warn!("Release aborted, skipping {} post hooks", post_hooks.len());
        } else {
            run_hooks("post", post_hooks, deadline, &mut report.hook_errors).await;
        }

        for e in &report.hook_errors {
            tracing::error!("Shutdown hook error: {}", e);
        }
        for e in &report.release.errors {
            tracing::error!("Release error: {}", e);
        }
        if report.is_clean() {
            tracing::info!("{} shut down cleanly", self.name);
        }
        report
    }
}

async fn run_hooks(
    stage: &str,
    hooks: Vec<(String, Hook)>,
    deadline: Instant,
    errors: &mut Vec<String>,
) {
    for (name, hook) in hooks {
        match tokio::time::timeout_at(deadline, hook(deadline)).await {
            Ok(Ok(())) => tracing::debug!("{} hook {} done", stage, name),
            Ok(Err(e)) => errors.push(format!("{stage} hook {name}: {e:#}")),
            Err(_) => errors.push(format!("{stage} hook {name}: deadline exceeded")),
        }
    }
}
