//! Virtual switch — a single boolean `on` parameter, readable and writable.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Deserialize;

use itemhub_app::ports::{Configurable, Gettable, Item, Settable};
use itemhub_domain::config::ItemConfig;
use itemhub_domain::error::{HubError, ValidationError};
use itemhub_domain::id::{ItemId, ItemType};
use itemhub_domain::state::{ConnectionStatus, ItemState};
use itemhub_domain::value::Value;

use crate::locator::ItemFactory;

pub const ITEM_TYPE: &str = "virtual_switch";
pub const ON_PARAMETER: &str = "on";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SwitchConfig {
    #[serde(default)]
    initial_on: bool,
}

/// A simulated switch. It is always reachable.
pub struct VirtualSwitch {
    item_id: ItemId,
    item_type: ItemType,
    on: AtomicBool,
}

impl VirtualSwitch {
    fn from_config(config: &ItemConfig) -> Result<Self, HubError> {
        let settings: SwitchConfig = config.decode()?;
        Ok(Self {
            item_id: config.item_id.clone(),
            item_type: config.item_type.clone(),
            on: AtomicBool::new(settings.initial_on),
        })
    }

    #[must_use]
    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }
}

impl Item for VirtualSwitch {
    fn item_id(&self) -> &ItemId {
        &self.item_id
    }

    fn item_type(&self) -> &ItemType {
        &self.item_type
    }

    fn as_gettable(&self) -> Option<&dyn Gettable> {
        Some(self)
    }

    fn as_settable(&self) -> Option<&dyn Settable> {
        Some(self)
    }

    fn as_configurable(&self) -> Option<&dyn Configurable> {
        Some(self)
    }
}

#[async_trait]
impl Gettable for VirtualSwitch {
    async fn get_state(&self) -> Result<ItemState, HubError> {
        Ok(ItemState::new(ConnectionStatus::Stable).with(ON_PARAMETER, self.is_on()))
    }
}

#[async_trait]
impl Settable for VirtualSwitch {
    async fn set_value(&self, parameter: &str, value: Value) -> Result<(), HubError> {
        if parameter != ON_PARAMETER {
            return Err(ValidationError::UnknownParameter {
                parameter: parameter.to_string(),
            }
            .into());
        }
        let on = value.as_bool().ok_or_else(|| ValidationError::TypeMismatch {
            expected: "bool",
            found: value.type_name().to_string(),
        })?;
        self.on.store(on, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Configurable for VirtualSwitch {
    /// The switch keeps its current position; only a new item picks up
    /// `InitialOn`.
    async fn configure(&self, config: &ItemConfig) -> Result<(), HubError> {
        let _: SwitchConfig = config.decode()?;
        Ok(())
    }
}

pub(crate) struct SwitchFactory;

impl ItemFactory for SwitchFactory {
    type Item = VirtualSwitch;

    fn create(&self, config: &ItemConfig) -> Result<Arc<VirtualSwitch>, HubError> {
        VirtualSwitch::from_config(config).map(Arc::new)
    }
}
