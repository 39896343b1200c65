//! State synchronizer — the periodic poll, publish and notify loop.

use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use itemhub_domain::error::HubError;
use itemhub_domain::event::StateChangedEvent;
use itemhub_domain::id::{ItemId, ItemType};
use itemhub_domain::state::{ConnectionStatus, ItemState, StatesContainer};
use itemhub_domain::time::{millis_between, now};
use itemhub_domain::tracking::TrackingRules;

use crate::diff::{UntrackedParameters, diff};
use crate::item_registry::ItemRegistry;
use crate::notification_bus::NotificationBus;
use crate::ports::Item;
use crate::snapshot::SnapshotStore;
use crate::state_transformer::StateTransformer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub interval: Duration,
    /// Consecutive failed polls before an item is reported Unstable.
    pub unstable_after: u32,
    /// Consecutive failed polls before an item is reported Lost.
    pub lost_after: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            unstable_after: 3,
            lost_after: 10,
        }
    }
}

impl SyncSettings {
    fn status_after(&self, failures: u32, previous: ConnectionStatus) -> ConnectionStatus {
        if failures >= self.lost_after {
            ConnectionStatus::Lost
        } else if failures >= self.unstable_after {
            ConnectionStatus::Unstable
        } else {
            previous
        }
    }
}

pub struct StateSynchronizer {
    settings: SyncSettings,
    registry: Arc<ItemRegistry>,
    store: Arc<SnapshotStore>,
    bus: Arc<NotificationBus>,
    transformer: Arc<StateTransformer>,
    rules: Arc<TrackingRules>,
    failures: Mutex<HashMap<ItemId, u32>>,
}

impl StateSynchronizer {
    #[must_use]
    pub fn new(
        settings: SyncSettings,
        registry: Arc<ItemRegistry>,
        store: Arc<SnapshotStore>,
        bus: Arc<NotificationBus>,
        transformer: Arc<StateTransformer>,
        rules: Arc<TrackingRules>,
    ) -> Self {
        Self {
            settings,
            registry,
            store,
            bus,
            transformer,
            rules,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Poll, publish and notify every interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // consume the immediate first tick
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.sync_once().await;
                }
            }
        }
        tracing::debug!("state synchronizer stopped");
    }

    /// Run one cycle and return the events it published.
    pub async fn sync_once(&self) -> Vec<StateChangedEvent> {
        let started = now();
        let items = self.registry.items();
        let previous = self.store.load();

        let gettable: Vec<&Arc<dyn Item>> =
            items.iter().filter(|i| i.as_gettable().is_some()).collect();
        let polls = join_all(gettable.iter().map(|item| poll(item.as_ref()))).await;

        let mut entries: Vec<(ItemType, ItemId, ItemState)> = Vec::with_capacity(polls.len());
        let mut untracked = UntrackedParameters::new();
        for (item, result) in gettable.iter().zip(polls) {
            let item_id = item.item_id();
            let before = previous.get(item_id.as_str());
            let state = match result {
                Ok(state) => {
                    self.record_success(item_id);
                    self.transformer.apply(item.as_ref(), before, state).await
                }
                Err(err) => {
                    let failures = self.record_failure(item_id);
                    tracing::warn!(%err, %item_id, failures, "item poll failed");
                    let mut carried = before.cloned().unwrap_or_default();
                    carried.connection_status = self
                        .settings
                        .status_after(failures, carried.connection_status);
                    carried
                }
            };
            let state = match self.rules.uncached_parameters(item_id.as_str()) {
                Some(uncached) => state.without(uncached),
                None => state,
            };
            if let Some(params) = item.as_gettable().map(|g| g.untracked_parameters()) {
                if !params.is_empty() {
                    untracked.insert(item_id.clone(), params.iter().cloned().collect::<BTreeSet<_>>());
                }
            }
            entries.push((item.item_type().clone(), item_id.clone(), state));
        }

        self.forget_removed(&items);
        let snapshot = StatesContainer::from_states(entries);
        let events = diff(&previous, &snapshot, &untracked);
        self.store.publish(snapshot);
        if !events.is_empty() {
            tracing::debug!(events = events.len(), "state changed");
            self.bus.publish(events.clone());
        }
        tracing::trace!(
            items = gettable.len(),
            elapsed_ms = millis_between(started, now()),
            "poll cycle done"
        );
        events
    }

    fn record_success(&self, item_id: &ItemId) {
        self.lock().remove(item_id);
    }

    fn record_failure(&self, item_id: &ItemId) -> u32 {
        let mut failures = self.lock();
        let count = failures.entry(item_id.clone()).or_default();
        *count = count.saturating_add(1);
        *count
    }

    fn forget_removed(&self, items: &[Arc<dyn Item>]) {
        let alive = |id: &ItemId| items.iter().any(|i| i.item_id() == id);
        self.lock().retain(|id, _| alive(id));
        self.transformer.retain_items(alive);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ItemId, u32>> {
        self.failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// A panicking item counts as a failed poll.
async fn poll(item: &dyn Item) -> Result<ItemState, HubError> {
    let Some(gettable) = item.as_gettable() else {
        return Err(crate::ports::item::unsupported(
            item,
            itemhub_domain::error::Capability::Gettable,
        ));
    };
    match AssertUnwindSafe(gettable.get_state()).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(HubError::device_message("state poll panicked")),
    }
}
