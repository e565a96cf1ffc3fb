//! Graceful shutdown coordinator.
//!
//! Shutting a generation down happens in three steps:
//! - stop accepting (the accept loop watches `stop_token`)
//! - drain: every open connection is asked to finish its in-flight work,
//!   bounded by the shutdown timeout
//! - force close: connections still open at the deadline are dropped
//!   (connection tasks watch `force_token`)
//!
//! Connections are counted through [`ConnectionGuard`]s.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ShutdownError;

/// Held by a connection task for as long as the connection is open.
///
/// Clones share one slot; the connection counts as closed when the last
/// clone drops.
#[derive(Clone)]
pub struct ConnectionGuard {
    _slot: Arc<OpenConnection>,
}

struct OpenConnection {
    open: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl Drop for OpenConnection {
    fn drop(&mut self) {
        if self.open.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// Coordinator for graceful shutdown with connection draining.
pub struct GracefulShutdown {
    /// Cancelled when the server should stop accepting new connections.
    stop_accepting: CancellationToken,

    /// Cancelled when connections still open must be dropped.
    force_close: CancellationToken,

    /// Open connections.
    open: Arc<AtomicUsize>,

    /// Notified when the last open connection closes.
    drained: Arc<Notify>,
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl GracefulShutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            stop_accepting: CancellationToken::new(),
            force_close: CancellationToken::new(),
            open: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
        }
    }

    /// Fires when the accept loop should stop.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop_accepting.clone()
    }

    /// Fires when connections still open must be dropped.
    pub fn force_token(&self) -> CancellationToken {
        self.force_close.clone()
    }

    /// Register a newly accepted connection.
    pub fn connection_guard(&self) -> ConnectionGuard {
        self.open.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            _slot: Arc::new(OpenConnection {
                open: Arc::clone(&self.open),
                drained: Arc::clone(&self.drained),
            }),
        }
    }

    /// Connections currently open.
    pub fn active_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Stop accepting without waiting for anything.
    pub fn trigger_stop(&self) {
        self.stop_accepting.cancel();
    }

    /// Wait for all connections to complete, up to `timeout`.
    ///
    /// Returns `true` if all connections drained, `false` if timed out.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let active = self.active_connections();
        if active == 0 {
            info!("No active connections, drain complete");
            return true;
        }

        info!(
            active_connections = active,
            timeout_ms = timeout.as_millis() as u64,
            "Draining active connections"
        );

        tokio::select! {
            _ = self.wait_for_drain() => {
                info!("All connections drained cleanly");
                true
            }
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    remaining_connections = self.active_connections(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Drain timeout expired"
                );
                false
            }
        }
    }

    async fn wait_for_drain(&self) {
        loop {
            // Register before checking so a wakeup between the two is not lost.
            let notified = self.drained.notified();
            if self.active_connections() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting, drain for at most `timeout`, then force-close the rest.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ShutdownError> {
        info!("Stopping accept loop");
        self.stop_accepting.cancel();

        let clean = self.drain(timeout).await;
        if clean {
            return Ok(());
        }

        let remaining = self.active_connections();
        warn!(remaining_connections = remaining, "Force-closing remaining connections");
        self.force_close.cancel();
        Err(ShutdownError::Timeout { remaining })
    }
}
