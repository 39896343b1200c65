//! Virtual sensor. Readings are pushed in from outside.
//!
//! Every `set_value` stores a reading and counts as a heartbeat for the
//! sensor's [`ConnectionWatchdog`]. A sensor nobody writes to drifts from
//! Stable to Unstable to Lost, like a real battery-powered device that went
//! quiet.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use itemhub_app::ports::{Disposable, Gettable, Initializable, Item, Settable};
use itemhub_app::watchdog::{ConnectionWatchdog, StatusCallback, WatchdogSettings};
use itemhub_domain::config::ItemConfig;
use itemhub_domain::error::HubError;
use itemhub_domain::id::{ItemId, ItemType};
use itemhub_domain::state::ItemState;
use itemhub_domain::value::Value;

use crate::locator::ItemFactory;

pub const ITEM_TYPE: &str = "virtual_sensor";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SensorConfig {
    non_stable_timeout_ms: Option<u64>,
    lost_timeout_ms: Option<u64>,
}

impl SensorConfig {
    fn watchdog(&self, defaults: WatchdogSettings) -> WatchdogSettings {
        WatchdogSettings {
            non_stable_timeout: self
                .non_stable_timeout_ms
                .map_or(defaults.non_stable_timeout, Duration::from_millis),
            lost_timeout: self
                .lost_timeout_ms
                .map_or(defaults.lost_timeout, Duration::from_millis),
        }
    }
}

pub struct VirtualSensor {
    item_id: ItemId,
    item_type: ItemType,
    readings: Mutex<BTreeMap<String, Value>>,
    watchdog: ConnectionWatchdog,
}

impl VirtualSensor {
    fn from_config(config: &ItemConfig, defaults: WatchdogSettings) -> Result<Self, HubError> {
        let settings: SensorConfig = config.decode()?;
        let item_id = config.item_id.clone();
        let callback: StatusCallback = {
            let item_id = item_id.clone();
            Arc::new(move |status| {
                tracing::info!(%item_id, %status, "virtual sensor connection changed");
            })
        };
        let watchdog = ConnectionWatchdog::new(settings.watchdog(defaults), callback)?;
        Ok(Self {
            item_id,
            item_type: config.item_type.clone(),
            readings: Mutex::new(BTreeMap::new()),
            watchdog,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        self.readings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Item for VirtualSensor {
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
impl Gettable for VirtualSensor {
    async fn get_state(&self) -> Result<ItemState, HubError> {
        let mut state = ItemState::new(self.watchdog.status());
        state.parameters = self.lock().clone();
        Ok(state)
    }
}

#[async_trait]
impl Settable for VirtualSensor {
    async fn set_value(&self, parameter: &str, value: Value) -> Result<(), HubError> {
        self.lock().insert(parameter.to_string(), value);
        self.watchdog.reset();
        Ok(())
    }
}

#[async_trait]
impl Initializable for VirtualSensor {
    async fn initialize(&self) -> Result<(), HubError> {
        self.watchdog.start();
        Ok(())
    }
}

#[async_trait]
impl Disposable for VirtualSensor {
    async fn dispose(&self) -> Result<(), HubError> {
        self.watchdog.stop().await;
        Ok(())
    }
}

pub(crate) struct SensorFactory {
    pub(crate) defaults: WatchdogSettings,
}

impl ItemFactory for SensorFactory {
    type Item = VirtualSensor;

    fn create(&self, config: &ItemConfig) -> Result<Arc<VirtualSensor>, HubError> {
        VirtualSensor::from_config(config, self.defaults).map(Arc::new)
    }
}

#[cfg(test)]
mod tests {
    use itemhub_domain::error::ValidationError;
    use itemhub_domain::state::ConnectionStatus;

    use super::*;

    fn sensor() -> VirtualSensor {
        let config = ItemConfig::new("porch", ITEM_TYPE)
            .with_field("NonStableTimeoutMs", 50)
            .with_field("LostTimeoutMs", 100);
        VirtualSensor::from_config(&config, WatchdogSettings::default()).unwrap()
    }

    #[test]
    fn should_reject_inconsistent_timeouts() {
        let config = ItemConfig::new("porch", ITEM_TYPE)
            .with_field("NonStableTimeoutMs", 100)
            .with_field("LostTimeoutMs", 100);

        let result = VirtualSensor::from_config(&config, WatchdogSettings::default());

        assert!(matches!(
            result,
            Err(HubError::Validation(
                ValidationError::NonIncreasingTimeouts { .. }
            ))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn should_start_unknown_until_first_reading() {
        let sensor = sensor();
        sensor.initialize().await.unwrap();

        let state = sensor.get_state().await.unwrap();

        assert_eq!(state.connection_status, ConnectionStatus::Unknown);
        assert!(state.parameters.is_empty());
        sensor.dispose().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn should_become_stable_on_reading() {
        let sensor = sensor();
        sensor.initialize().await.unwrap();

        sensor
            .set_value("temperature", Value::Float(21.5))
            .await
            .unwrap();

        let state = sensor.get_state().await.unwrap();
        assert_eq!(state.connection_status, ConnectionStatus::Stable);
        assert_eq!(state.get("temperature"), Some(&Value::Float(21.5)));
        sensor.dispose().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn should_degrade_when_readings_stop() {
        let sensor = sensor();
        sensor.initialize().await.unwrap();
        sensor.set_value("temperature", Value::Int(20)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(
            sensor.get_state().await.unwrap().connection_status,
            ConnectionStatus::Unstable
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        let state = sensor.get_state().await.unwrap();
        assert_eq!(state.connection_status, ConnectionStatus::Lost);
        assert_eq!(state.get("temperature"), Some(&Value::Int(20)));
        sensor.dispose().await.unwrap();
    }
}
