//! Locator port — factory and lifecycle owner of every item of one type.
//!
//! Locators are either compiled in (see the virtual adapter) or supplied by
//! a loaded plugin module. Config changes reach them through the
//! `config_*` callbacks; spontaneous changes to their item set (a plugin
//! discovering a device, for instance) are signalled through the
//! [`LocatorSink`] handed to [`Locator::attach`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use itemhub_domain::config::ItemConfig;
use itemhub_domain::error::HubError;
use itemhub_domain::id::{ItemId, ItemType};

use super::item::Item;

/// Change in a locator's item set, raised by the locator itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocatorEvent {
    ItemAdded(ItemId),
    ItemDeleted(ItemId),
}

/// Signal travelling from a locator to the item registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorSignal {
    pub item_type: ItemType,
    pub event: LocatorEvent,
}

/// Handle a locator uses to raise [`LocatorEvent`]s.
///
/// Sending never blocks; signals raised after the registry stopped are
/// dropped.
#[derive(Debug, Clone)]
pub struct LocatorSink {
    item_type: ItemType,
    sender: mpsc::UnboundedSender<LocatorSignal>,
}

impl LocatorSink {
    #[must_use]
    pub fn new(item_type: ItemType, sender: mpsc::UnboundedSender<LocatorSignal>) -> Self {
        Self { item_type, sender }
    }

    pub fn item_added(&self, item_id: ItemId) {
        self.raise(LocatorEvent::ItemAdded(item_id));
    }

    pub fn item_deleted(&self, item_id: ItemId) {
        self.raise(LocatorEvent::ItemDeleted(item_id));
    }

    fn raise(&self, event: LocatorEvent) {
        let signal = LocatorSignal {
            item_type: self.item_type.clone(),
            event,
        };
        if self.sender.send(signal).is_err() {
            tracing::debug!(item_type = %self.item_type, "registry gone, locator signal dropped");
        }
    }
}

#[async_trait]
pub trait Locator: Send + Sync {
    /// The single item type this locator manages.
    fn item_type(&self) -> &ItemType;

    /// Immediate-init locators are registered, and their items initialized,
    /// before every lazy one.
    fn immediate_init(&self) -> bool {
        false
    }

    /// Live item set, in the order items should be initialized.
    fn items(&self) -> Vec<Arc<dyn Item>>;

    /// Receive the sink used to signal spontaneous item set changes.
    fn attach(&self, _sink: LocatorSink) {}

    /// # Errors
    ///
    /// Returns an error when no item can be built from the config.
    async fn config_added(&self, config: ItemConfig) -> Result<(), HubError>;

    /// # Errors
    ///
    /// Returns an error when the new config cannot be applied.
    async fn config_updated(&self, config: ItemConfig) -> Result<(), HubError>;

    /// Drop the item built from the config. Disposal is done by the
    /// registry once the item leaves [`items`](Self::items).
    ///
    /// # Errors
    ///
    /// Returns an error when the locator fails to forget the item.
    async fn config_deleted(&self, item_id: &ItemId) -> Result<(), HubError>;
}
