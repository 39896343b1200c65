//! Item living in a plugin process.

use std::sync::Arc;

use async_trait::async_trait;

use itemhub_app::ports::{Disposable, Gettable, Initializable, Item, Settable};
use itemhub_app::watchdog::{ConnectionWatchdog, StatusCallback, WatchdogSettings};
use itemhub_domain::error::HubError;
use itemhub_domain::id::{ItemId, ItemType};
use itemhub_domain::state::{ConnectionStatus, ItemState};
use itemhub_domain::value::Value;

use crate::error::PluginError;
use crate::protocol::Request;
use crate::runtime::PluginProcess;

/// Proxy forwarding every capability call to the plugin.
///
/// Any answer from the plugin, an error answer included, is a heartbeat
/// for the item's watchdog; timeouts and a dead process are not.
pub struct RemoteItem {
    item_id: ItemId,
    item_type: ItemType,
    process: Arc<PluginProcess>,
    watchdog: ConnectionWatchdog,
}

impl RemoteItem {
    pub(crate) fn new(
        item_id: ItemId,
        item_type: ItemType,
        process: Arc<PluginProcess>,
        settings: WatchdogSettings,
    ) -> Result<Self, HubError> {
        let callback: StatusCallback = {
            let item_id = item_id.clone();
            Arc::new(move |status| {
                tracing::info!(%item_id, %status, "plugin item connection changed");
            })
        };
        Ok(Self {
            item_id,
            item_type,
            process,
            watchdog: ConnectionWatchdog::new(settings, callback)?,
        })
    }

    pub(crate) fn heartbeat(&self) {
        self.watchdog.reset();
    }

    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        self.watchdog.status()
    }

    async fn ask(&self, request: Request) -> Result<serde_json::Value, PluginError> {
        let result = self.process.request(&request).await;
        if matches!(result, Ok(_) | Err(PluginError::Remote(_))) {
            self.heartbeat();
        }
        result
    }
}

impl Item for RemoteItem {
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

    fn as_initializable(&self) -> Option<&dyn Initializable> {
        Some(self)
    }

    fn as_disposable(&self) -> Option<&dyn Disposable> {
        Some(self)
    }
}

#[async_trait]
impl Gettable for RemoteItem {
    /// A plugin reporting `Unknown` defers to the watchdog.
    async fn get_state(&self) -> Result<ItemState, HubError> {
        let result = self
            .ask(Request::GetState {
                item_id: self.item_id.clone(),
            })
            .await?;
        let mut state: ItemState = serde_json::from_value(result).map_err(PluginError::Decode)?;
        if state.connection_status == ConnectionStatus::Unknown {
            state.connection_status = self.watchdog.status();
        }
        Ok(state)
    }
}

#[async_trait]
impl Settable for RemoteItem {
    async fn set_value(&self, parameter: &str, value: Value) -> Result<(), HubError> {
        self.ask(Request::SetValue {
            item_id: self.item_id.clone(),
            parameter: parameter.to_string(),
            value,
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Initializable for RemoteItem {
    async fn initialize(&self) -> Result<(), HubError> {
        self.watchdog.start();
        self.ask(Request::Initialize {
            item_id: self.item_id.clone(),
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Disposable for RemoteItem {
    async fn dispose(&self) -> Result<(), HubError> {
        let result = self
            .ask(Request::Dispose {
                item_id: self.item_id.clone(),
            })
            .await;
        self.watchdog.stop().await;
        result.map(drop).map_err(HubError::from)
    }
}
