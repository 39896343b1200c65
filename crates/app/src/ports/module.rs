//! Module runtime port — how a plugin library file becomes locators.
//!
//! The module loader (filesystem adapter) decides *when* a library file is
//! loaded or unloaded; a [`ModuleRuntime`] decides *how*. A runtime returns
//! the locators the module exposes together with an opaque anchor: the
//! module is considered reclaimed once the last strong reference to the
//! anchor is gone.

use std::any::Any;
use std::path::Path;
use std::sync::{Arc, Weak};

use async_trait::async_trait;

use itemhub_domain::error::HubError;
use itemhub_domain::event::StateChangedEvent;
use itemhub_domain::id::SubscriberId;
use itemhub_domain::value::Value;

use super::item::Item;
use super::locator::Locator;
use super::subscriber::Subscriber;
use crate::command_executor::{CommandBatch, CommandOutcome};
use crate::hub::{Hub, SetValueResult};

/// Result of loading one library file.
pub struct LoadedModule {
    pub locators: Vec<Arc<dyn Locator>>,
    /// Every locator and item of the module keeps this alive.
    pub anchor: Arc<dyn Any + Send + Sync>,
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field(
                "locators",
                &self
                    .locators
                    .iter()
                    .map(|l| l.item_type().to_string())
                    .collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ModuleRuntime: Send + Sync {
    /// Whether this runtime can load the given library file.
    fn accepts(&self, path: &Path) -> bool;

    /// Load a library file and instantiate every locator it exposes.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be started or exposes no
    /// locator.
    async fn load(&self, path: &Path, context: HubContext) -> Result<LoadedModule, HubError>;

    /// Stop a module whose anchor nothing else references anymore. The
    /// anchor is dropped on return.
    async fn release(&self, anchor: Arc<dyn Any + Send + Sync>) {
        drop(anchor);
    }
}

/// Shared context handed to module and static locators.
///
/// Holds only a weak reference to the hub, so locators and items can call
/// back into it without keeping it alive.
#[derive(Clone, Default)]
pub struct HubContext {
    hub: Weak<Hub>,
}

impl HubContext {
    #[must_use]
    pub fn new(hub: &Arc<Hub>) -> Self {
        Self {
            hub: Arc::downgrade(hub),
        }
    }

    /// Context not attached to any hub; every call fails or is a no-op.
    #[must_use]
    pub fn detached() -> Self {
        Self::default()
    }

    fn hub(&self) -> Result<Arc<Hub>, HubError> {
        self.hub.upgrade().ok_or(HubError::Cancelled)
    }

    pub async fn set_value(&self, item_id: &str, parameter: &str, value: Value) -> SetValueResult {
        match self.hub() {
            Ok(hub) => hub.set_value(item_id, parameter, value).await,
            Err(err) => SetValueResult::failed(err.to_string()),
        }
    }

    #[must_use]
    pub fn get_value(&self, item_id: &str, parameter: &str) -> Option<Value> {
        self.hub().ok()?.get_value(item_id, parameter)
    }

    #[must_use]
    pub fn find_item(&self, item_id: &str) -> Option<Arc<dyn Item>> {
        self.hub().ok()?.find_item(item_id)
    }

    pub fn notify_subscribers(&self, event: StateChangedEvent) {
        if let Ok(hub) = self.hub() {
            hub.notify_subscribers(event);
        }
    }

    /// # Errors
    ///
    /// Returns [`HubError::Cancelled`] once the hub is gone.
    pub fn register_subscriber(
        &self,
        subscriber: &Arc<dyn Subscriber>,
    ) -> Result<SubscriberId, HubError> {
        Ok(self.hub()?.register_subscriber(subscriber))
    }

    pub fn unregister_subscriber(&self, id: SubscriberId) {
        if let Ok(hub) = self.hub() {
            hub.unregister_subscriber(id);
        }
    }

    /// # Errors
    ///
    /// Returns [`HubError::Cancelled`] once the hub is gone.
    pub async fn execute_commands(
        &self,
        owner: &str,
        batch: CommandBatch,
    ) -> Result<CommandOutcome, HubError> {
        Ok(self.hub()?.execute_commands(owner, batch).await)
    }
}

impl std::fmt::Debug for HubContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubContext")
            .field("attached", &(self.hub.strong_count() > 0))
            .finish()
    }
}
