//! Per-item connection watchdog.
//!
//! A small timeout-driven state machine: without a heartbeat an item goes
//! from Stable (or Unknown) to Unstable after `non_stable_timeout`, then to
//! Lost once `lost_timeout` has elapsed since the last heartbeat. A
//! heartbeat ([`ConnectionWatchdog::reset`]) brings it back to Stable.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use itemhub_domain::error::ValidationError;
use itemhub_domain::state::ConnectionStatus;

/// Callback invoked on status transitions, in the order they happen. It
/// must not call back into the watchdog's `reset`.
pub type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogSettings {
    pub non_stable_timeout: Duration,
    pub lost_timeout: Duration,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            non_stable_timeout: Duration::from_secs(30),
            lost_timeout: Duration::from_secs(120),
        }
    }
}

impl WatchdogSettings {
    /// # Errors
    ///
    /// Returns [`ValidationError::NonIncreasingTimeouts`] unless
    /// `lost_timeout > non_stable_timeout`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.lost_timeout <= self.non_stable_timeout {
            return Err(ValidationError::NonIncreasingTimeouts {
                non_stable_ms: self.non_stable_timeout.as_millis(),
                lost_ms: self.lost_timeout.as_millis(),
            });
        }
        Ok(())
    }
}

struct WatchState {
    status: ConnectionStatus,
    last_heartbeat: Instant,
    generation: u64,
}

struct Shared {
    settings: WatchdogSettings,
    state: Mutex<WatchState>,
    wake: Notify,
    callback: StatusCallback,
    /// Last status handed to the callback.
    delivered: Mutex<ConnectionStatus>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, WatchState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Deadline of the next step, with the generation it was computed for.
    fn next_deadline(&self) -> (Option<Instant>, u64) {
        let state = self.lock();
        let deadline = match state.status {
            ConnectionStatus::Unknown | ConnectionStatus::Stable => {
                Some(state.last_heartbeat + self.settings.non_stable_timeout)
            }
            ConnectionStatus::Unstable => Some(state.last_heartbeat + self.settings.lost_timeout),
            ConnectionStatus::Lost => None,
        };
        (deadline, state.generation)
    }

    fn expire(&self, generation: u64) {
        {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            let next = match state.status {
                ConnectionStatus::Unknown | ConnectionStatus::Stable => ConnectionStatus::Unstable,
                ConnectionStatus::Unstable => ConnectionStatus::Lost,
                ConnectionStatus::Lost => return,
            };
            state.status = next;
            state.generation += 1;
        }
        self.deliver();
    }

    /// Hand the current status to the callback unless it already has it.
    /// Serialized, so a stale status never overtakes a newer one.
    fn deliver(&self) {
        let mut delivered = self
            .delivered
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let status = self.lock().status;
        if *delivered != status {
            *delivered = status;
            (self.callback)(status);
        }
    }
}

pub struct ConnectionWatchdog {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionWatchdog {
    /// Create a watchdog in the Unknown state. Timing starts with
    /// [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::NonIncreasingTimeouts`] for inconsistent
    /// settings.
    pub fn new(settings: WatchdogSettings, callback: StatusCallback) -> Result<Self, ValidationError> {
        settings.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                settings,
                state: Mutex::new(WatchState {
                    status: ConnectionStatus::Unknown,
                    last_heartbeat: Instant::now(),
                    generation: 0,
                }),
                wake: Notify::new(),
                callback,
                delivered: Mutex::new(ConnectionStatus::Unknown),
            }),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.shared.lock().status
    }

    /// Spawn the timer loop. Calling it twice has no effect.
    pub fn start(&self) {
        let mut task = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        {
            let mut state = self.shared.lock();
            state.last_heartbeat = Instant::now();
            state.generation += 1;
        }
        *task = Some(tokio::spawn(run(Arc::clone(&self.shared), self.cancel.clone())));
    }

    /// Heartbeat: become Stable now and restart the timer.
    pub fn reset(&self) {
        {
            let mut state = self.shared.lock();
            state.last_heartbeat = Instant::now();
            state.generation += 1;
            state.status = ConnectionStatus::Stable;
        }
        self.shared.wake.notify_one();
        self.shared.deliver();
    }

    /// Stop the timer loop and wait for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                tracing::warn!(%err, "watchdog task ended abnormally");
            }
        }
    }
}

impl Drop for ConnectionWatchdog {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let (deadline, generation) = shared.next_deadline();
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = shared.wake.notified() => {}
                    () = tokio::time::sleep_until(deadline) => shared.expire(generation),
                }
            }
            None => {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = shared.wake.notified() => {}
                }
            }
        }
    }
}
