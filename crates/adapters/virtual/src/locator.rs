//! Config-driven locator shared by every static item kind.
//!
//! Each kind only knows how to build one item from its config; the locator
//! keeps the table of live items and routes config callbacks to it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use itemhub_app::ports::{Item, Locator};
use itemhub_domain::config::ItemConfig;
use itemhub_domain::error::HubError;
use itemhub_domain::id::{ItemId, ItemType};

/// Builds the items of one static kind.
pub(crate) trait ItemFactory: Send + Sync {
    type Item: Item + 'static;

    /// # Errors
    ///
    /// Returns a validation error when the config cannot be decoded.
    fn create(&self, config: &ItemConfig) -> Result<Arc<Self::Item>, HubError>;
}

pub(crate) struct StaticLocator<F: ItemFactory> {
    item_type: ItemType,
    immediate: bool,
    factory: F,
    items: Mutex<Vec<Arc<F::Item>>>,
}

impl<F: ItemFactory> StaticLocator<F> {
    pub(crate) fn new(item_type: &str, immediate: bool, factory: F) -> Self {
        Self {
            item_type: ItemType::from(item_type),
            immediate,
            factory,
            items: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<F::Item>>> {
        self.items
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn find(&self, item_id: &ItemId) -> Option<Arc<F::Item>> {
        self.lock().iter().find(|i| i.item_id() == item_id).cloned()
    }

    /// Insert or replace, keeping the position of a replaced item.
    fn upsert(&self, item: Arc<F::Item>) {
        let mut items = self.lock();
        match items.iter().position(|i| i.item_id() == item.item_id()) {
            Some(index) => items[index] = item,
            None => items.push(item),
        }
    }
}

#[async_trait]
impl<F: ItemFactory> Locator for StaticLocator<F> {
    fn item_type(&self) -> &ItemType {
        &self.item_type
    }

    fn immediate_init(&self) -> bool {
        self.immediate
    }

    fn items(&self) -> Vec<Arc<dyn Item>> {
        self.lock()
            .iter()
            .map(|item| Arc::clone(item) as Arc<dyn Item>)
            .collect()
    }

    async fn config_added(&self, config: ItemConfig) -> Result<(), HubError> {
        let item = self.factory.create(&config)?;
        tracing::debug!(item_type = %self.item_type, item_id = %config.item_id, "static item created");
        self.upsert(item);
        Ok(())
    }

    async fn config_updated(&self, config: ItemConfig) -> Result<(), HubError> {
        if let Some(existing) = self.find(&config.item_id) {
            if let Some(configurable) = existing.as_configurable() {
                return configurable.configure(&config).await;
            }
        }
        self.upsert(self.factory.create(&config)?);
        Ok(())
    }

    async fn config_deleted(&self, item_id: &ItemId) -> Result<(), HubError> {
        self.lock().retain(|i| i.item_id() != item_id);
        Ok(())
    }
}
