//! Locator living in a plugin process.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use itemhub_app::ports::{Item, Locator, LocatorSink};
use itemhub_app::watchdog::WatchdogSettings;
use itemhub_domain::config::ItemConfig;
use itemhub_domain::error::HubError;
use itemhub_domain::id::{ItemId, ItemType};

use crate::item::RemoteItem;
use crate::protocol::{LocatorSpec, Request};
use crate::runtime::PluginProcess;

pub struct RemoteLocator {
    item_type: ItemType,
    immediate_init: bool,
    process: Arc<PluginProcess>,
    watchdog: WatchdogSettings,
    items: Mutex<Vec<Arc<RemoteItem>>>,
    sink: Mutex<Option<LocatorSink>>,
}

impl RemoteLocator {
    pub(crate) fn new(
        spec: LocatorSpec,
        process: Arc<PluginProcess>,
        watchdog: WatchdogSettings,
    ) -> Self {
        Self {
            item_type: spec.item_type,
            immediate_init: spec.immediate_init,
            process,
            watchdog,
            items: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<RemoteItem>>> {
        self.items
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn find(&self, item_id: &ItemId) -> Option<Arc<RemoteItem>> {
        self.lock().iter().find(|i| i.item_id() == item_id).cloned()
    }

    /// Returns `false` when the item was already known.
    fn insert(&self, item_id: &ItemId) -> Result<bool, HubError> {
        let mut items = self.lock();
        if items.iter().any(|i| i.item_id() == item_id) {
            return Ok(false);
        }
        let item = RemoteItem::new(
            item_id.clone(),
            self.item_type.clone(),
            Arc::clone(&self.process),
            self.watchdog,
        )?;
        items.push(Arc::new(item));
        Ok(true)
    }

    fn remove(&self, item_id: &ItemId) -> bool {
        let mut items = self.lock();
        let before = items.len();
        items.retain(|i| i.item_id() != item_id);
        items.len() != before
    }

    fn sink(&self) -> Option<LocatorSink> {
        self.sink
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// The plugin found an item nobody configured.
    pub(crate) fn discovered(&self, item_id: ItemId) {
        match self.insert(&item_id) {
            Ok(true) => {
                if let Some(sink) = self.sink() {
                    sink.item_added(item_id);
                }
            }
            Ok(false) => {}
            Err(err) => tracing::warn!(%err, %item_id, "discovered item rejected"),
        }
    }

    /// The plugin lost an item on its own.
    pub(crate) fn vanished(&self, item_id: ItemId) {
        if self.remove(&item_id) {
            if let Some(sink) = self.sink() {
                sink.item_deleted(item_id);
            }
        }
    }
}

#[async_trait]
impl Locator for RemoteLocator {
    fn item_type(&self) -> &ItemType {
        &self.item_type
    }

    fn immediate_init(&self) -> bool {
        self.immediate_init
    }

    fn items(&self) -> Vec<Arc<dyn Item>> {
        self.lock()
            .iter()
            .map(|item| Arc::clone(item) as Arc<dyn Item>)
            .collect()
    }

    fn attach(&self, sink: LocatorSink) {
        *self
            .sink
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(sink);
    }

    async fn config_added(&self, config: ItemConfig) -> Result<(), HubError> {
        self.process
            .request(&Request::ConfigAdded {
                config: config.to_document(),
            })
            .await?;
        self.insert(&config.item_id)?;
        Ok(())
    }

    async fn config_updated(&self, config: ItemConfig) -> Result<(), HubError> {
        self.process
            .request(&Request::ConfigUpdated {
                config: config.to_document(),
            })
            .await?;
        self.insert(&config.item_id)?;
        Ok(())
    }

    async fn config_deleted(&self, item_id: &ItemId) -> Result<(), HubError> {
        self.process
            .request(&Request::ConfigDeleted {
                item_id: item_id.clone(),
            })
            .await?;
        self.remove(item_id);
        Ok(())
    }
}
