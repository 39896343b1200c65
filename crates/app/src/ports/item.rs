//! Item port: the unit of integration exposed by a locator.
//!
//! An item always has an identity. Everything else is an optional
//! capability, discovered at runtime through the `as_*` accessors so the
//! core can treat devices, virtual items and scenario handlers uniformly.

use async_trait::async_trait;

use itemhub_domain::config::ItemConfig;
use itemhub_domain::error::{Capability, HubError};
use itemhub_domain::id::{ItemId, ItemType};
use itemhub_domain::state::ItemState;
use itemhub_domain::value::Value;

use super::subscriber::Transformable;

/// A pluggable item.
///
/// Implementations return `Some(self)` from the accessors of the
/// capabilities they support; the defaults advertise none.
pub trait Item: Send + Sync {
    fn item_id(&self) -> &ItemId;

    fn item_type(&self) -> &ItemType;

    fn as_gettable(&self) -> Option<&dyn Gettable> {
        None
    }

    fn as_settable(&self) -> Option<&dyn Settable> {
        None
    }

    fn as_configurable(&self) -> Option<&dyn Configurable> {
        None
    }

    fn as_initializable(&self) -> Option<&dyn Initializable> {
        None
    }

    fn as_disposable(&self) -> Option<&dyn Disposable> {
        None
    }

    /// Handler rewriting externally set values before they are published.
    fn as_transformable(&self) -> Option<&dyn Transformable> {
        None
    }
}

/// Build the error returned when an item lacks a capability.
#[must_use]
pub fn unsupported(item: &dyn Item, capability: Capability) -> HubError {
    HubError::Unsupported {
        item_id: item.item_id().clone(),
        capability,
    }
}

/// Items whose state is polled by the synchronizer.
#[async_trait]
pub trait Gettable: Send + Sync {
    /// Read the current state from the device.
    ///
    /// # Errors
    ///
    /// Any error counts as a transient failure for this poll cycle.
    async fn get_state(&self) -> Result<ItemState, HubError>;

    /// Parameters that never generate change events.
    fn untracked_parameters(&self) -> &[String] {
        &[]
    }
}

/// Items accepting writes.
#[async_trait]
pub trait Settable: Send + Sync {
    /// Write one parameter.
    ///
    /// # Errors
    ///
    /// Returns an error when the device refuses or cannot be reached.
    async fn set_value(&self, parameter: &str, value: Value) -> Result<(), HubError>;
}

/// Items that can be reconfigured in place when their config changes.
#[async_trait]
pub trait Configurable: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the new config cannot be applied.
    async fn configure(&self, config: &ItemConfig) -> Result<(), HubError>;
}

/// Items requiring setup before they are listed as ready.
#[async_trait]
pub trait Initializable: Send + Sync {
    /// # Errors
    ///
    /// A failed initialization keeps the item out of the ready list; it is
    /// retried on the next registry sync.
    async fn initialize(&self) -> Result<(), HubError>;
}

/// Items holding resources that must be released on removal.
#[async_trait]
pub trait Disposable: Send + Sync {
    /// # Errors
    ///
    /// Errors are logged; the item is removed regardless.
    async fn dispose(&self) -> Result<(), HubError>;
}
