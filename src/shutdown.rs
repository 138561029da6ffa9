//! Graceful shutdown handling for the vodedge service.
//!
//! A single [`ShutdownCoordinator`] fans the stop signal out to every
//! long-lived task: the HTTP server, the capacity watchdog, the memory
//! backend's expiry sweep, and in-flight hybrid promotions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::info;

/// Shutdown coordinator for managing graceful service termination.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    /// Broadcast channel for the shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
    /// Watch channel for checking if shutdown is in progress.
    shutdown_watch: watch::Receiver<bool>,
    /// Internal sender for the watch channel.
    shutdown_watch_tx: Arc<watch::Sender<bool>>,
    /// Flag indicating if shutdown has been initiated.
    is_shutting_down: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (shutdown_watch_tx, shutdown_watch) = watch::channel(false);

        Self {
            shutdown_tx,
            shutdown_watch,
            shutdown_watch_tx: Arc::new(shutdown_watch_tx),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to shutdown signals.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Check if shutdown is in progress.
    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Initiate shutdown. Idempotent.
    pub fn shutdown(&self) {
        if self
            .is_shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Initiating graceful shutdown");
            let _ = self.shutdown_watch_tx.send(true);
            let _ = self.shutdown_tx.send(());
        }
    }

    /// Wait for the shutdown signal (for use in select! arms).
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_watch.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Install OS signal handlers and trip the coordinator when one fires.
    #[cfg(unix)]
    pub async fn listen_for_signals(self) {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        self.shutdown();
    }

    /// Install OS signal handlers (non-Unix version).
    #[cfg(not(unix))]
    pub async fn listen_for_signals(self) {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Received Ctrl+C");
        self.shutdown();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_signals_subscribers() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();

        assert!(!coordinator.is_shutting_down());
        coordinator.shutdown();
        assert!(coordinator.is_shutting_down());

        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("subscriber should be signalled")
            .expect("channel should deliver");
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.shutdown();
        coordinator.shutdown();
        assert!(coordinator.is_shutting_down());
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_observes_prior_signal() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.shutdown();

        tokio::time::timeout(Duration::from_secs(1), coordinator.wait_for_shutdown())
            .await
            .expect("wait should return after shutdown");
    }
}
