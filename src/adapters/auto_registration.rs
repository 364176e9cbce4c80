use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use tokio::{task::JoinHandle, time::Instant};

use crate::{
    core::lifecycle::{ErrorReporter, Lifecycle, LifecycleError},
    ports::registry::{DeregisterParam, RegisterParam, Registry},
};

/// Registers the local instance when collected and deregisters it on dispose.
pub struct AutoRegistration {
    registry: Arc<dyn Registry>,
    param: RegisterParam,
    registered: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AutoRegistration {
    pub fn new(registry: Arc<dyn Registry>, param: RegisterParam) -> Self {
        Self {
            registry,
            param,
            registered: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Lifecycle for AutoRegistration {
    /// Registration runs in the background; a failure is reported and ends the app.
    fn on_created(&self, errors: ErrorReporter) {
        let registry = self.registry.clone();
        let param = self.param.clone();
        let registered = self.registered.clone();
        let task = tokio::spawn(async move {
            match registry.register(&param).await {
                Ok(()) => {
                    registered.store(true, Ordering::Release);
                    tracing::info!("Registered {} as {}", param.addr, param.service_name);
                }
                Err(e) => {
                    tracing::error!("Register {} failed: {}", param.service_name, e);
                    errors.report(
                        eyre::Report::new(e)
                            .wrap_err(format!("registering {} failed", param.service_name)),
                    );
                }
            }
        });
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    async fn on_dispose(&self, deadline: Instant) -> Result<(), LifecycleError> {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut task) = task {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                return Err(LifecycleError::DeadlineExceeded);
            }
        }

        if !self.registered.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let param = DeregisterParam::from(&self.param);
        match tokio::time::timeout_at(deadline, self.registry.deregister(&param)).await {
            Ok(Ok(())) => {
                tracing::info!("Deregistered {} as {}", param.addr, param.service_name);
                Ok(())
            }
            Ok(Err(e)) => Err(LifecycleError::failed(format!(
                "deregister {} failed: {e}",
                param.service_name
            ))),
            Err(_) => Err(LifecycleError::DeadlineExceeded),
        }
    }
}
