use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use eyre::Result;
use tokio::sync::broadcast;

/// Why the application is asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
    /// SIGHUP
    Hangup,
    /// SIGQUIT
    Quit,
    /// Requested from inside the process
    Manual,
}

/// Turns OS signals into a single broadcast shutdown request
#[derive(Clone)]
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<ShutdownReason>,
    shutdown_initiated: Arc<AtomicBool>,
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            shutdown_tx,
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::Acquire)
    }

    /// Request shutdown; only the first request is broadcast.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) -> bool {
        if self
            .shutdown_initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("Shutdown already initiated, ignoring {:?}", reason);
            return false;
        }
        tracing::info!("Shutdown requested: {:?}", reason);
        let _ = self.shutdown_tx.send(reason);
        true
    }

    /// Wait for the first of SIGINT, SIGTERM, SIGHUP or SIGQUIT and broadcast it.
    pub async fn run_signal_handler(&self) -> Result<ShutdownReason> {
        tracing::info!("Signal handler started. Listening for SIGINT, SIGTERM, SIGHUP and SIGQUIT");
        let reason = wait_for_signal().await?;
        tracing::info!("Received {:?}, initiating graceful shutdown...", reason);
        self.trigger_shutdown(reason);
        Ok(reason)
    }

    /// Resolve once shutdown was requested, by a signal or by [`Self::trigger_shutdown`].
    pub async fn wait_for_shutdown_signal(&self) -> ShutdownReason {
        let mut receiver = self.subscribe();
        if self.is_shutdown_initiated() {
            return receiver.try_recv().unwrap_or(ShutdownReason::Manual);
        }
        match receiver.recv().await {
            Ok(reason) => reason,
            Err(_) => {
                tracing::warn!("Shutdown channel closed unexpectedly");
                ShutdownReason::Manual
            }
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<ShutdownReason> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigquit = signal(SignalKind::quit())?;

    Ok(tokio::select! {
        _ = sigint.recv() => ShutdownReason::Interrupt,
        _ = sigterm.recv() => ShutdownReason::Terminate,
        _ = sighup.recv() => ShutdownReason::Hangup,
        _ = sigquit.recv() => ShutdownReason::Quit,
    })
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<ShutdownReason> {
    tokio::signal::ctrl_c().await?;
    Ok(ShutdownReason::Interrupt)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_manual_trigger_shutdown() {
        let shutdown = GracefulShutdown::new();
        assert!(!shutdown.is_shutdown_initiated());
        let mut receiver = shutdown.subscribe();

        assert!(shutdown.trigger_shutdown(ShutdownReason::Manual));
        assert!(shutdown.is_shutdown_initiated());
        assert_eq!(receiver.try_recv().unwrap(), ShutdownReason::Manual);
    }

    #[tokio::test]
    async fn test_only_first_request_is_broadcast() {
        let shutdown = GracefulShutdown::new();
        let mut receiver = shutdown.subscribe();

        assert!(shutdown.trigger_shutdown(ShutdownReason::Terminate));
        assert!(!shutdown.trigger_shutdown(ShutdownReason::Hangup));
        assert_eq!(receiver.try_recv().unwrap(), ShutdownReason::Terminate);
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_trigger() {
        let shutdown = GracefulShutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait_for_shutdown_signal().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger_shutdown(ShutdownReason::Quit);

        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, ShutdownReason::Quit);
    }

    #[tokio::test]
    async fn test_wait_after_trigger_returns() {
        let shutdown = GracefulShutdown::new();
        shutdown.trigger_shutdown(ShutdownReason::Manual);
        let reason = tokio::time::timeout(Duration::from_secs(1), shutdown.wait_for_shutdown_signal())
            .await
            .unwrap();
        assert_eq!(reason, ShutdownReason::Manual);
    }
}
