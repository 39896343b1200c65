//! Item registry — the single, ordered list of ready items.
//!
//! Every locator registration and every item mutation goes through one
//! async mutex. After each mutation the registry compares a locator's live
//! item set with the items it already knows: new items are initialized and
//! announced, vanished or replaced ones are disposed and announced. The
//! resulting ready list is published by whole-value replacement, so
//! [`ItemRegistry::items`] never waits for the mutex.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use itemhub_domain::error::HubError;
use itemhub_domain::id::{ItemId, ItemType};

use crate::locator_registry::LocatorRegistry;
use crate::ports::{Item, Locator, LocatorEvent, LocatorSignal, LocatorSink};
use crate::reconcile::ConfigChange;

const EVENT_CHANNEL_SIZE: usize = 256;

/// Ready list snapshot, immediate-init locators' items first.
pub type ItemList = Vec<Arc<dyn Item>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    ItemAdded { item_type: ItemType, item_id: ItemId },
    ItemDeleted { item_type: ItemType, item_id: ItemId },
}

#[derive(Default)]
struct RegistryState {
    locators: LocatorRegistry,
    ready: HashMap<ItemType, Vec<Arc<dyn Item>>>,
}

pub struct ItemRegistry {
    state: Mutex<RegistryState>,
    items: ArcSwap<ItemList>,
    events: broadcast::Sender<RegistryEvent>,
    signals: mpsc::UnboundedSender<LocatorSignal>,
    signal_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<LocatorSignal>>>,
}

impl Default for ItemRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemRegistry {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (signals, signal_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(RegistryState::default()),
            items: ArcSwap::from_pointee(Vec::new()),
            events,
            signals,
            signal_rx: std::sync::Mutex::new(Some(signal_rx)),
        }
    }

    /// Current ready items, without locking.
    #[must_use]
    pub fn items(&self) -> Arc<ItemList> {
        self.items.load_full()
    }

    #[must_use]
    pub fn find(&self, item_id: &str) -> Option<Arc<dyn Item>> {
        self.items
            .load()
            .iter()
            .find(|item| item.item_id().as_str() == item_id)
            .cloned()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Item types that currently have a locator, in initialization order.
    pub async fn locator_types(&self) -> Vec<ItemType> {
        let state = self.state.lock().await;
        state.locators.iter().map(|l| l.item_type().clone()).collect()
    }

    /// Register the startup locators, immediate-init ones first, then
    /// initialize their items in that order.
    #[tracing::instrument(skip_all, fields(locators = locators.len()))]
    pub async fn start(&self, mut locators: Vec<Arc<dyn Locator>>) {
        locators.sort_by_key(|l| !l.immediate_init());
        let mut state = self.state.lock().await;
        for locator in locators {
            let item_type = locator.item_type().clone();
            locator.attach(self.sink(&item_type));
            if let Err(err) = state.locators.register(locator).await {
                tracing::warn!(%err, %item_type, "locator skipped");
            }
        }
        let types: Vec<ItemType> = state
            .locators
            .iter()
            .map(|l| l.item_type().clone())
            .collect();
        for item_type in &types {
            self.sync(&mut state, item_type).await;
        }
        self.publish(&state);
    }

    /// Register one more locator (a freshly loaded module, typically).
    ///
    /// # Errors
    ///
    /// Fails when the item type already has a locator.
    pub async fn register_locator(&self, locator: Arc<dyn Locator>) -> Result<(), HubError> {
        let item_type = locator.item_type().clone();
        let mut state = self.state.lock().await;
        locator.attach(self.sink(&item_type));
        state.locators.register(locator).await?;
        self.sync(&mut state, &item_type).await;
        self.publish(&state);
        Ok(())
    }

    /// Remove a locator and dispose every item it owned.
    pub async fn unregister_locator(&self, item_type: &ItemType) -> Option<Arc<dyn Locator>> {
        let mut state = self.state.lock().await;
        let locator = state.locators.unregister(item_type)?;
        self.sync(&mut state, item_type).await;
        self.publish(&state);
        Some(locator)
    }

    /// Forward reconciled config changes to their locators and refresh the
    /// affected item sets.
    pub async fn apply(&self, changes: Vec<ConfigChange>) {
        if changes.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        let mut touched: Vec<ItemType> = Vec::new();
        for change in changes {
            for item_type in state.locators.dispatch(change).await {
                if !touched.contains(&item_type) {
                    touched.push(item_type);
                }
            }
        }
        // initialize in locator order, immediate-init types first
        let ordered: Vec<ItemType> = state
            .locators
            .iter()
            .map(|l| l.item_type().clone())
            .filter(|item_type| touched.contains(item_type))
            .collect();
        for item_type in &ordered {
            self.sync(&mut state, item_type).await;
        }
        self.publish(&state);
    }

    /// Re-read one locator's item set.
    pub async fn resync(&self, item_type: &ItemType) {
        let mut state = self.state.lock().await;
        self.sync(&mut state, item_type).await;
        self.publish(&state);
    }

    /// Drain locator signals until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let receiver = self
            .signal_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(mut receiver) = receiver else {
            tracing::warn!("registry signal loop already running");
            return;
        };
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                signal = receiver.recv() => {
                    let Some(signal) = signal else { break };
                    match &signal.event {
                        LocatorEvent::ItemAdded(item_id) => {
                            tracing::debug!(item_type = %signal.item_type, %item_id, "locator raised item added");
                        }
                        LocatorEvent::ItemDeleted(item_id) => {
                            tracing::debug!(item_type = %signal.item_type, %item_id, "locator raised item deleted");
                        }
                    }
                    self.resync(&signal.item_type).await;
                }
            }
        }
    }

    /// Dispose every item and forget all locators.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        let types: Vec<ItemType> = state
            .locators
            .iter()
            .map(|l| l.item_type().clone())
            .collect();
        for item_type in types {
            let _ = state.locators.unregister(&item_type);
            self.sync(&mut state, &item_type).await;
        }
        self.publish(&state);
    }

    fn sink(&self, item_type: &ItemType) -> LocatorSink {
        LocatorSink::new(item_type.clone(), self.signals.clone())
    }

    async fn sync(&self, state: &mut RegistryState, item_type: &ItemType) {
        let current: Vec<Arc<dyn Item>> = state
            .locators
            .get(item_type)
            .map(|l| l.items())
            .unwrap_or_default();
        let known = state.ready.remove(item_type).unwrap_or_default();

        let (kept, gone): (Vec<_>, Vec<_>) = known
            .into_iter()
            .partition(|item| current.iter().any(|c| Arc::ptr_eq(c, item)));
        for item in gone {
            if let Some(disposable) = item.as_disposable() {
                if let Err(err) = disposable.dispose().await {
                    tracing::warn!(%err, item_id = %item.item_id(), "item dispose failed");
                }
            }
            tracing::info!(%item_type, item_id = %item.item_id(), "item deleted");
            self.emit(RegistryEvent::ItemDeleted {
                item_type: item_type.clone(),
                item_id: item.item_id().clone(),
            });
        }

        let mut ready = Vec::with_capacity(current.len());
        for item in current {
            if kept.iter().any(|k| Arc::ptr_eq(k, &item)) {
                ready.push(item);
                continue;
            }
            if let Some(initializable) = item.as_initializable() {
                if let Err(err) = initializable.initialize().await {
                    tracing::warn!(%err, %item_type, item_id = %item.item_id(), "item initialization failed");
                    continue;
                }
            }
            tracing::info!(%item_type, item_id = %item.item_id(), "item added");
            self.emit(RegistryEvent::ItemAdded {
                item_type: item_type.clone(),
                item_id: item.item_id().clone(),
            });
            ready.push(item);
        }
        if !ready.is_empty() {
            state.ready.insert(item_type.clone(), ready);
        }
    }

    fn publish(&self, state: &RegistryState) {
        let list: ItemList = state
            .locators
            .iter()
            .filter_map(|l| state.ready.get(l.item_type()))
            .flat_map(|items| items.iter().cloned())
            .collect();
        self.items.store(Arc::new(list));
    }

    fn emit(&self, event: RegistryEvent) {
        // no receiver is not an error
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::ports::{Disposable, Initializable};
    use itemhub_domain::config::ItemConfig;

    /// Item recording lifecycle calls in a shared journal.
    pub(crate) struct JournalItem {
        id: ItemId,
        item_type: ItemType,
        journal: Arc<StdMutex<Vec<String>>>,
        fail_init: bool,
    }

    impl Item for JournalItem {
        fn item_id(&self) -> &ItemId {
            &self.id
        }

        fn item_type(&self) -> &ItemType {
            &self.item_type
        }

        fn as_initializable(&self) -> Option<&dyn Initializable> {
            Some(self)
        }

        fn as_disposable(&self) -> Option<&dyn Disposable> {
            Some(self)
        }
    }

    #[async_trait]
    impl Initializable for JournalItem {
        async fn initialize(&self) -> Result<(), HubError> {
            if self.fail_init {
                return Err(HubError::device_message("no answer"));
            }
            self.journal.lock().unwrap().push(format!("init:{}", self.id));
            Ok(())
        }
    }

    #[async_trait]
    impl Disposable for JournalItem {
        async fn dispose(&self) -> Result<(), HubError> {
            self.journal.lock().unwrap().push(format!("dispose:{}", self.id));
            Ok(())
        }
    }

    /// Locator building one [`JournalItem`] per config.
    pub(crate) struct JournalLocator {
        item_type: ItemType,
        immediate: bool,
        journal: Arc<StdMutex<Vec<String>>>,
        items: StdMutex<Vec<Arc<dyn Item>>>,
        sink: StdMutex<Option<LocatorSink>>,
    }

    impl JournalLocator {
        pub(crate) fn new(
            item_type: &str,
            immediate: bool,
            journal: &Arc<StdMutex<Vec<String>>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                item_type: ItemType::from(item_type),
                immediate,
                journal: Arc::clone(journal),
                items: StdMutex::new(Vec::new()),
                sink: StdMutex::new(None),
            })
        }

        fn build(&self, item_id: &ItemId, fail_init: bool) -> Arc<dyn Item> {
            Arc::new(JournalItem {
                id: item_id.clone(),
                item_type: self.item_type.clone(),
                journal: Arc::clone(&self.journal),
                fail_init,
            })
        }

        /// Simulate a spontaneously discovered device.
        pub(crate) fn discover(&self, item_id: &str) {
            let item_id = ItemId::from(item_id);
            let item = self.build(&item_id, false);
            self.items.lock().unwrap().push(item);
            if let Some(sink) = self.sink.lock().unwrap().as_ref() {
                sink.item_added(item_id);
            }
        }
    }

    #[async_trait]
    impl Locator for JournalLocator {
        fn item_type(&self) -> &ItemType {
            &self.item_type
        }

        fn immediate_init(&self) -> bool {
            self.immediate
        }

        fn items(&self) -> Vec<Arc<dyn Item>> {
            self.items.lock().unwrap().clone()
        }

        fn attach(&self, sink: LocatorSink) {
            *self.sink.lock().unwrap() = Some(sink);
        }

        async fn config_added(&self, config: ItemConfig) -> Result<(), HubError> {
            let fail_init = config.field("fail_init").and_then(|v| v.as_bool()) == Some(true);
            let item = self.build(&config.item_id, fail_init);
            self.items.lock().unwrap().push(item);
            Ok(())
        }

        async fn config_updated(&self, config: ItemConfig) -> Result<(), HubError> {
            let replacement = self.build(&config.item_id, false);
            let mut items = self.items.lock().unwrap();
            for item in items.iter_mut() {
                if item.item_id() == &config.item_id {
                    *item = Arc::clone(&replacement);
                }
            }
            Ok(())
        }

        async fn config_deleted(&self, item_id: &ItemId) -> Result<(), HubError> {
            self.items.lock().unwrap().retain(|i| i.item_id() != item_id);
            Ok(())
        }
    }

    fn journal() -> Arc<StdMutex<Vec<String>>> {
        Arc::new(StdMutex::new(Vec::new()))
    }

    fn ids(registry: &ItemRegistry) -> Vec<String> {
        registry
            .items()
            .iter()
            .map(|i| i.item_id().to_string())
            .collect()
    }

    #[tokio::test]
    async fn should_initialize_immediate_locator_items_first() {
        let journal = journal();
        let registry = ItemRegistry::new();
        registry
            .apply(vec![
                ConfigChange::Added(ItemConfig::new("sensor", "lazy")),
                ConfigChange::Added(ItemConfig::new("switch", "eager")),
            ])
            .await;

        registry
            .start(vec![
                JournalLocator::new("lazy", false, &journal) as Arc<dyn Locator>,
                JournalLocator::new("eager", true, &journal) as Arc<dyn Locator>,
            ])
            .await;

        assert_eq!(ids(&registry), vec!["switch", "sensor"]);
        assert_eq!(*journal.lock().unwrap(), vec!["init:switch", "init:sensor"]);
    }

    #[tokio::test]
    async fn should_raise_added_and_deleted_events() {
        let journal = journal();
        let registry = ItemRegistry::new();
        let mut events = registry.subscribe();
        registry
            .start(vec![JournalLocator::new("lamp", false, &journal) as Arc<dyn Locator>])
            .await;

        let config = ItemConfig::new("desk", "lamp");
        registry.apply(vec![ConfigChange::Added(config.clone())]).await;
        registry.apply(vec![ConfigChange::Deleted(config)]).await;

        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::ItemAdded {
                item_type: ItemType::from("lamp"),
                item_id: ItemId::from("desk"),
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::ItemDeleted {
                item_type: ItemType::from("lamp"),
                item_id: ItemId::from("desk"),
            }
        );
        assert!(registry.items().is_empty());
        assert_eq!(*journal.lock().unwrap(), vec!["init:desk", "dispose:desk"]);
    }

    #[tokio::test]
    async fn should_replace_item_when_locator_rebuilds_it() {
        let journal = journal();
        let registry = ItemRegistry::new();
        registry
            .start(vec![JournalLocator::new("lamp", false, &journal) as Arc<dyn Locator>])
            .await;
        let config = ItemConfig::new("desk", "lamp");
        registry.apply(vec![ConfigChange::Added(config.clone())]).await;

        registry
            .apply(vec![ConfigChange::Updated {
                previous: config.clone(),
                current: config.with_field("color", "red"),
            }])
            .await;

        assert_eq!(ids(&registry), vec!["desk"]);
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["init:desk", "dispose:desk", "init:desk"]
        );
    }

    #[tokio::test]
    async fn should_keep_failed_item_out_of_ready_list() {
        let journal = journal();
        let registry = ItemRegistry::new();
        registry
            .start(vec![JournalLocator::new("lamp", false, &journal) as Arc<dyn Locator>])
            .await;

        registry
            .apply(vec![
                ConfigChange::Added(ItemConfig::new("broken", "lamp").with_field("fail_init", true)),
                ConfigChange::Added(ItemConfig::new("fine", "lamp")),
            ])
            .await;

        assert_eq!(ids(&registry), vec!["fine"]);
    }

    #[tokio::test]
    async fn should_dispose_items_when_locator_unregisters() {
        let journal = journal();
        let registry = ItemRegistry::new();
        registry
            .start(vec![JournalLocator::new("lamp", false, &journal) as Arc<dyn Locator>])
            .await;
        registry
            .apply(vec![ConfigChange::Added(ItemConfig::new("desk", "lamp"))])
            .await;

        let removed = registry.unregister_locator(&ItemType::from("lamp")).await;

        assert!(removed.is_some());
        assert!(registry.items().is_empty());
        assert!(registry.locator_types().await.is_empty());
        assert_eq!(*journal.lock().unwrap(), vec!["init:desk", "dispose:desk"]);
    }

    #[tokio::test]
    async fn should_pick_up_items_raised_by_locator() {
        let journal = journal();
        let registry = Arc::new(ItemRegistry::new());
        let locator = JournalLocator::new("ble", false, &journal);
        registry
            .start(vec![Arc::clone(&locator) as Arc<dyn Locator>])
            .await;
        let cancel = CancellationToken::new();
        let runner = tokio::spawn({
            let registry = Arc::clone(&registry);
            let cancel = cancel.clone();
            async move { registry.run(cancel).await }
        });
        let mut events = registry.subscribe();

        locator.discover("tag-1");

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            RegistryEvent::ItemAdded {
                item_type: ItemType::from("ble"),
                item_id: ItemId::from("tag-1"),
            }
        );
        assert!(registry.find("tag-1").is_some());
        cancel.cancel();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn should_dispose_everything_on_shutdown() {
        let journal = journal();
        let registry = ItemRegistry::new();
        registry
            .apply(vec![ConfigChange::Added(ItemConfig::new("desk", "lamp"))])
            .await;
        registry
            .start(vec![JournalLocator::new("lamp", false, &journal) as Arc<dyn Locator>])
            .await;

        registry.shutdown().await;

        assert!(registry.items().is_empty());
        assert_eq!(*journal.lock().unwrap(), vec!["init:desk", "dispose:desk"]);
    }
}
