//! Signal-driven lifecycle of a serving process.
//!
//! ```text
//! Running --restart--> Succeeding --ok--> ShuttingDown --> Stopped
//!    ^                     |
//!    +--------error--------+
//! Running --terminate--> ShuttingDown --> Stopped
//! ```
//!
//! Signals are handled strictly one at a time. A signal arriving while a
//! succession attempt is in progress waits in the queue until the attempt
//! resolves.

use std::io;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn, Instrument};

use crate::server::Generation;
use crate::succession::Succession;
use crate::ShutdownError;

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Serving and waiting for signals.
    Running,
    /// A succession attempt is in progress.
    Succeeding,
    /// Draining the current generation.
    ShuttingDown,
    /// Terminal.
    Stopped,
}

/// Signals the lifecycle reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// `SIGHUP`: hand the listener to a replacement process.
    Restart,
    /// `SIGTERM` / `SIGINT`: shut down.
    Terminate,
}

/// Why the lifecycle reached [`LifecycleState::Stopped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// A replacement process took over the listener.
    Succeeded,
    /// A termination signal was received, or the signal queue closed.
    Terminated,
}

/// Subscribe to `SIGHUP`, `SIGTERM` and `SIGINT`, queued with the given capacity.
///
/// Must be called from within a tokio runtime.
pub fn signal_queue(capacity: usize) -> io::Result<mpsc::Receiver<LifecycleSignal>> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    let (tx, rx) = mpsc::channel(capacity.max(1));
    let forward = async move {
        loop {
            let received = tokio::select! {
                Some(()) = hangup.recv() => {
                    info!("Received SIGHUP, initiating succession");
                    LifecycleSignal::Restart
                }
                Some(()) = terminate.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                    LifecycleSignal::Terminate
                }
                Some(()) = interrupt.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                    LifecycleSignal::Terminate
                }
                else => break,
            };

            if tx.send(received).await.is_err() {
                break;
            }
        }
    };
    tokio::spawn(forward.in_current_span());

    Ok(rx)
}

/// The top-level control loop of a serving process.
pub struct Lifecycle {
    succession: Succession,
    shutdown_timeout: Duration,
    state: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    pub fn new(succession: Succession, shutdown_timeout: Duration) -> Self {
        let (state, _) = watch::channel(LifecycleState::Running);
        Self {
            succession,
            shutdown_timeout,
            state,
        }
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    fn transition(&self, next: LifecycleState) {
        let prev = self.state.send_replace(next);
        debug!(from = ?prev, to = ?next, "Lifecycle transition");
    }

    /// Process signals until the generation has been shut down.
    ///
    /// The shutdown error, if any, is returned for logging only.
    pub async fn run(
        &self,
        mut signals: mpsc::Receiver<LifecycleSignal>,
        generation: Generation,
    ) -> Result<LifecycleOutcome, ShutdownError> {
        self.transition(LifecycleState::Running);

        let outcome = loop {
            let Some(received) = signals.recv().await else {
                warn!("Signal queue closed, shutting down");
                break LifecycleOutcome::Terminated;
            };

            match received {
                LifecycleSignal::Restart => {
                    self.transition(LifecycleState::Succeeding);
                    match self.succession.handle_restart_signal().await {
                        Ok(()) => break LifecycleOutcome::Succeeded,
                        Err(e) => {
                            error!(error = %e, "Succession failed, continuing to serve");
                            self.transition(LifecycleState::Running);
                        }
                    }
                }
                LifecycleSignal::Terminate => break LifecycleOutcome::Terminated,
            }
        };

        self.transition(LifecycleState::ShuttingDown);
        let result = generation.stop(self.shutdown_timeout).await;
        self.transition(LifecycleState::Stopped);

        info!(outcome = ?outcome, "Lifecycle complete");
        result.map(|()| outcome)
    }
}
