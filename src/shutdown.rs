//! Graceful Shutdown Handling
//!
//! Stops the listener on SIGTERM/SIGINT and gives in-flight requests a bounded
//! amount of time to finish before the process exits.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    /// Broadcast sender for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// How long the server may take to drain once shutdown starts
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shutdown_tx,
            timeout,
        }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Future that resolves once shutdown has been triggered.
    ///
    /// Subscribes immediately, so a trigger after this call is never missed.
    pub fn shutdown_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut shutdown_rx = self.subscribe();
        async move {
            let _ = shutdown_rx.recv().await;
        }
    }

    /// Broadcast shutdown to every subscriber
    pub fn trigger(&self) {
        if let Err(e) = self.shutdown_tx.send(()) {
            debug!("No shutdown subscribers: {}", e);
        }
    }

    /// Wait for SIGTERM or SIGINT (Ctrl+C on Windows), then trigger shutdown
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();
        Ok(())
    }

    /// Wait for the server task to drain, aborting it after the timeout
    pub async fn wait_for_server(&self, mut handle: JoinHandle<Result<()>>) -> Result<()> {
        let start_time = Instant::now();

        match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(Ok(result)) => {
                info!("Server drained in {:?}", start_time.elapsed());
                result
            }
            Ok(Err(e)) if e.is_cancelled() => {
                debug!("Server task was cancelled");
                Ok(())
            }
            Ok(Err(e)) => Err(anyhow::anyhow!("Server task failed: {}", e)),
            Err(_) => {
                warn!("Shutdown timeout reached after {:?}, closing remaining connections", self.timeout);
                handle.abort();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_shutdown_signal_broadcast() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut receiver = coordinator.subscribe();

        coordinator.trigger();

        assert!(receiver.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_signal_future_resolves_after_trigger() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let signal = coordinator.shutdown_signal();

        coordinator.trigger();

        tokio::time::timeout(Duration::from_secs(1), signal)
            .await
            .expect("shutdown signal should resolve");
    }

    #[tokio::test]
    async fn test_wait_for_server_returns_task_result() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let handle = tokio::spawn(async { Ok(()) });

        assert!(coordinator.wait_for_server(handle).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_server_aborts_after_timeout() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        let handle = tokio::spawn(async {
            sleep(Duration::from_secs(60)).await;
            Ok(())
        });

        let started = Instant::now();
        assert!(coordinator.wait_for_server(handle).await.is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_wait_for_server_propagates_error() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let handle = tokio::spawn(async { Err(anyhow::anyhow!("bind failed")) });

        let err = coordinator.wait_for_server(handle).await.unwrap_err();
        assert!(err.to_string().contains("bind failed"));
    }
}
