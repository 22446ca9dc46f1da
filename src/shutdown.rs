//! Graceful Shutdown Handling
//!
//! Turns SIGTERM/SIGINT into a broadcast shutdown notification and waits,
//! bounded by a timeout, for the I/O loop to finish its in-flight relay pairs.

use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::event_loop;
use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    /// Broadcast sender for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// How long `drain` waits for the I/O loop
    timeout: Duration,
}

impl ShutdownCoordinator {
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

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Notify subscribers without waiting for a signal
    pub fn trigger(&self) {
        if self.shutdown_tx.send(()).is_err() {
            tracing::debug!("Shutdown triggered with no subscribers");
        }
    }

    /// Wait for SIGTERM, SIGINT or Ctrl+C, then notify subscribers
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
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();
        Ok(())
    }

    /// Wait up to the timeout for the I/O loop to exit. Returns `true` if it
    /// did; relay pairs still open after that are abandoned.
    pub async fn drain(&self) -> bool {
        let start_time = Instant::now();
        info!(
            "Waiting for active connections to close (timeout: {:?})",
            self.timeout
        );

        let timeout = self.timeout;
        let exited = tokio::task::spawn_blocking(move || event_loop::wait_for_exit_timeout(timeout))
            .await
            .unwrap_or(false);

        let elapsed = start_time.elapsed();
        if exited {
            info!("All connections closed gracefully in {:?}", elapsed);
        } else {
            warn!("Shutdown timeout reached after {:?} with connections still active", elapsed);
        }
        exited
    }
}

/// What ended a `wait_for_shutdown`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownCause {
    /// The coordinator was triggered, normally by a signal
    Requested,
    /// Every listener, channel and relay pair is gone
    LoopExited,
}

/// Wait until either a shutdown is broadcast on `shutdown_rx` or the I/O loop
/// exits on its own.
pub async fn wait_for_shutdown(mut shutdown_rx: broadcast::Receiver<()>) -> ShutdownCause {
    tokio::select! {
        biased;
        _ = shutdown_rx.recv() => ShutdownCause::Requested,
        _ = wait_for_event_loop() => ShutdownCause::LoopExited,
    }
}

/// Resolve once the I/O loop has exited on its own.
///
/// Waits in bounded slices so that dropping the future never leaves a
/// blocking thread parked on the loop.
pub async fn wait_for_event_loop() {
    loop {
        let exited = tokio::task::spawn_blocking(|| {
            event_loop::wait_for_exit_timeout(Duration::from_millis(250))
        })
        .await;

        match exited {
            Ok(true) => return,
            Ok(false) => continue,
            Err(e) => {
                warn!("Event loop waiter failed: {}", e);
                return;
            }
        }
    }
}
