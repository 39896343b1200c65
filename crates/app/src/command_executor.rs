//! Command executor — retried, cancellable multi-target writes.
//!
//! Batches are tied to an owner (a scenario, a plugin, an API caller).
//! Starting a new batch for an owner cancels every retry loop that owner
//! still has running, and a single-slot gate makes sure at most one batch
//! per owner talks to the devices at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use itemhub_domain::error::HubError;
use itemhub_domain::id::ItemId;
use itemhub_domain::value::Value;

/// Upper bound on cancellation handles drained for one owner in one go.
const EMERGENCY_DRAIN_CAP: usize = 1_024;

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub item_id: ItemId,
    pub parameter: String,
    pub value: Value,
}

impl Command {
    #[must_use]
    pub fn new(
        item_id: impl Into<ItemId>,
        parameter: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            parameter: parameter.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandBatch {
    pub name: String,
    pub commands: Vec<Command>,
}

impl CommandBatch {
    #[must_use]
    pub fn new(name: impl Into<String>, commands: Vec<Command>) -> Self {
        Self {
            name: name.into(),
            commands,
        }
    }
}

/// How a batch ended. None of these is an error.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Completed { tries: u32 },
    Exhausted { tries: u32, failed: Vec<Command> },
    Cancelled,
}

/// Where commands are sent; the hub implements this with `set_value`.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// # Errors
    ///
    /// Any error marks the command as failed for this try.
    async fn dispatch(&self, command: &Command) -> Result<(), HubError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    pub max_tries: u32,
    pub failover_interval: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_tries: 3,
            failover_interval: Duration::from_secs(5),
        }
    }
}

struct OwnerSlot {
    pending: VecDeque<(u64, CancellationToken)>,
    gate: Arc<Semaphore>,
}

impl Default for OwnerSlot {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            gate: Arc::new(Semaphore::new(1)),
        }
    }
}

pub struct CommandExecutor {
    settings: ExecutorSettings,
    owners: Mutex<HashMap<String, OwnerSlot>>,
    tickets: AtomicU64,
}

impl CommandExecutor {
    #[must_use]
    pub fn new(settings: ExecutorSettings) -> Self {
        Self {
            settings,
            owners: Mutex::new(HashMap::new()),
            tickets: AtomicU64::new(0),
        }
    }

    /// Run a batch for `owner`, superseding any batch it still has running.
    #[tracing::instrument(skip(self, batch, sink), fields(batch = %batch.name))]
    pub async fn execute(
        &self,
        owner: &str,
        batch: CommandBatch,
        sink: &dyn CommandSink,
    ) -> CommandOutcome {
        let (ticket, token, gate) = self.enter(owner);
        let outcome = self.run(batch, sink, &token, gate).await;
        self.leave(owner, ticket);
        match &outcome {
            CommandOutcome::Completed { tries } => {
                tracing::debug!(tries, "command batch completed");
            }
            CommandOutcome::Exhausted { tries, failed } => {
                tracing::warn!(tries, failed = failed.len(), "command batch gave up");
            }
            CommandOutcome::Cancelled => tracing::debug!("command batch cancelled"),
        }
        outcome
    }

    /// Cancel every batch still running for `owner`.
    pub fn cancel(&self, owner: &str) {
        let mut owners = self.lock();
        if let Some(slot) = owners.get_mut(owner) {
            drain(owner, &mut slot.pending);
        }
    }

    fn enter(&self, owner: &str) -> (u64, CancellationToken, Arc<Semaphore>) {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let mut owners = self.lock();
        let slot = owners.entry(owner.to_string()).or_default();
        drain(owner, &mut slot.pending);
        slot.pending.push_back((ticket, token.clone()));
        (ticket, token, Arc::clone(&slot.gate))
    }

    fn leave(&self, owner: &str, ticket: u64) {
        let mut owners = self.lock();
        if let Some(slot) = owners.get_mut(owner) {
            slot.pending.retain(|(t, _)| *t != ticket);
            if slot.pending.is_empty() {
                owners.remove(owner);
            }
        }
    }

    async fn run(
        &self,
        batch: CommandBatch,
        sink: &dyn CommandSink,
        token: &CancellationToken,
        gate: Arc<Semaphore>,
    ) -> CommandOutcome {
        let _permit = tokio::select! {
            biased;
            () = token.cancelled() => return CommandOutcome::Cancelled,
            permit = gate.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return CommandOutcome::Cancelled,
            },
        };

        let max_tries = self.settings.max_tries.max(1);
        let mut remaining = batch.commands;
        for attempt in 1..=max_tries {
            if token.is_cancelled() {
                return CommandOutcome::Cancelled;
            }
            let results = join_all(remaining.iter().map(|command| sink.dispatch(command))).await;
            remaining = remaining
                .into_iter()
                .zip(results)
                .filter_map(|(command, result)| match result {
                    Ok(()) => None,
                    Err(err) => {
                        tracing::debug!(
                            %err,
                            attempt,
                            item_id = %command.item_id,
                            parameter = %command.parameter,
                            "command failed"
                        );
                        Some(command)
                    }
                })
                .collect();
            if remaining.is_empty() {
                return CommandOutcome::Completed { tries: attempt };
            }
            if attempt == max_tries {
                break;
            }
            if token.is_cancelled() {
                return CommandOutcome::Cancelled;
            }
            tokio::select! {
                biased;
                () = token.cancelled() => return CommandOutcome::Cancelled,
                () = tokio::time::sleep(self.settings.failover_interval) => {}
            }
        }
        CommandOutcome::Exhausted {
            tries: max_tries,
            failed: remaining,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, OwnerSlot>> {
        self.owners
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn drain(owner: &str, pending: &mut VecDeque<(u64, CancellationToken)>) {
    let mut drained = 0;
    while let Some((_, token)) = pending.pop_front() {
        token.cancel();
        drained += 1;
        if drained >= EMERGENCY_DRAIN_CAP {
            tracing::warn!(owner, remaining = pending.len(), "cancellation drain capped");
            pending.clear();
            break;
        }
    }
}
