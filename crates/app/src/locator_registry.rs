//! Locator registry — one locator per item type, fed with config changes.
//!
//! The registry keeps every config it has been told about, grouped by item
//! type. A config whose type has no locator yet is simply kept; it is
//! replayed when a matching locator registers. The same replay serves a
//! plugin module that is reloaded: the new locator receives every config of
//! its type again.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use itemhub_domain::config::ItemConfig;
use itemhub_domain::error::{HubError, ValidationError};
use itemhub_domain::id::{ItemId, ItemType};

use crate::ports::Locator;
use crate::reconcile::ConfigChange;

#[derive(Default)]
pub struct LocatorRegistry {
    locators: Vec<Arc<dyn Locator>>,
    configs: HashMap<ItemType, BTreeMap<ItemId, ItemConfig>>,
}

impl LocatorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, item_type: &ItemType) -> Option<&Arc<dyn Locator>> {
        self.locators.iter().find(|l| l.item_type() == item_type)
    }

    /// Locators, immediate-init ones first, then in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Locator>> {
        self.locators.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.locators.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locators.is_empty()
    }

    /// Configs of a type that no registered locator owns.
    #[must_use]
    pub fn buffered(&self, item_type: &ItemType) -> usize {
        if self.get(item_type).is_some() {
            return 0;
        }
        self.configs.get(item_type).map_or(0, BTreeMap::len)
    }

    /// Register a locator and replay every known config of its type.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::DuplicateLocator`] when the type already
    /// has a locator.
    pub async fn register(&mut self, locator: Arc<dyn Locator>) -> Result<(), HubError> {
        let item_type = locator.item_type().clone();
        if self.get(&item_type).is_some() {
            return Err(ValidationError::DuplicateLocator { item_type }.into());
        }
        let position = if locator.immediate_init() {
            self.locators
                .iter()
                .position(|l| !l.immediate_init())
                .unwrap_or(self.locators.len())
        } else {
            self.locators.len()
        };
        self.locators.insert(position, Arc::clone(&locator));
        tracing::info!(%item_type, immediate = locator.immediate_init(), "locator registered");

        let replay: Vec<ItemConfig> = self
            .configs
            .get(&item_type)
            .map(|configs| configs.values().cloned().collect())
            .unwrap_or_default();
        for config in replay {
            let item_id = config.item_id.clone();
            if let Err(err) = locator.config_added(config).await {
                tracing::warn!(%err, %item_id, %item_type, "locator rejected buffered config");
            }
        }
        Ok(())
    }

    /// Remove the locator of a type. Its configs stay known.
    pub fn unregister(&mut self, item_type: &ItemType) -> Option<Arc<dyn Locator>> {
        let position = self
            .locators
            .iter()
            .position(|l| l.item_type() == item_type)?;
        tracing::info!(%item_type, "locator unregistered");
        Some(self.locators.remove(position))
    }

    /// Record a config change and forward it to the owning locator.
    ///
    /// Returns the item types whose locator received something.
    pub async fn dispatch(&mut self, change: ConfigChange) -> Vec<ItemType> {
        match change {
            ConfigChange::Added(config) => self.add(config).await.into_iter().collect(),
            ConfigChange::Updated { previous, current } if previous.item_type != current.item_type => {
                let mut touched: Vec<ItemType> = self.delete(previous).await.into_iter().collect();
                touched.extend(self.add(current).await);
                touched
            }
            ConfigChange::Updated { current, .. } => self.update(current).await.into_iter().collect(),
            ConfigChange::Deleted(config) => self.delete(config).await.into_iter().collect(),
        }
    }

    async fn add(&mut self, config: ItemConfig) -> Option<ItemType> {
        self.store(&config);
        let Some(locator) = self.get(&config.item_type).cloned() else {
            tracing::debug!(item_id = %config.item_id, item_type = %config.item_type, "no locator yet, config buffered");
            return None;
        };
        let (item_id, item_type) = (config.item_id.clone(), config.item_type.clone());
        if let Err(err) = locator.config_added(config).await {
            tracing::warn!(%err, %item_id, %item_type, "locator rejected added config");
        }
        Some(item_type)
    }

    async fn update(&mut self, config: ItemConfig) -> Option<ItemType> {
        self.store(&config);
        let locator = self.get(&config.item_type).cloned()?;
        let (item_id, item_type) = (config.item_id.clone(), config.item_type.clone());
        if let Err(err) = locator.config_updated(config).await {
            tracing::warn!(%err, %item_id, %item_type, "locator rejected updated config");
        }
        Some(item_type)
    }

    async fn delete(&mut self, config: ItemConfig) -> Option<ItemType> {
        if let Some(configs) = self.configs.get_mut(&config.item_type) {
            configs.remove(&config.item_id);
        }
        let locator = self.get(&config.item_type).cloned()?;
        if let Err(err) = locator.config_deleted(&config.item_id).await {
            tracing::warn!(%err, item_id = %config.item_id, item_type = %config.item_type, "locator failed to delete config");
        }
        Some(config.item_type)
    }

    fn store(&mut self, config: &ItemConfig) {
        self.configs
            .entry(config.item_type.clone())
            .or_default()
            .insert(config.item_id.clone(), config.clone());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::ports::Item;

    /// Locator that records every callback it receives.
    pub(crate) struct RecordingLocator {
        item_type: ItemType,
        immediate: bool,
        pub calls: Mutex<Vec<String>>,
    }

    impl RecordingLocator {
        pub(crate) fn new(item_type: &str, immediate: bool) -> Self {
            Self {
                item_type: ItemType::from(item_type),
                immediate,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl Locator for RecordingLocator {
        fn item_type(&self) -> &ItemType {
            &self.item_type
        }

        fn immediate_init(&self) -> bool {
            self.immediate
        }

        fn items(&self) -> Vec<Arc<dyn Item>> {
            Vec::new()
        }

        async fn config_added(&self, config: ItemConfig) -> Result<(), HubError> {
            self.record(format!("added:{}", config.item_id));
            Ok(())
        }

        async fn config_updated(&self, config: ItemConfig) -> Result<(), HubError> {
            self.record(format!("updated:{}", config.item_id));
            Ok(())
        }

        async fn config_deleted(&self, item_id: &ItemId) -> Result<(), HubError> {
            self.record(format!("deleted:{item_id}"));
            Ok(())
        }
    }

    fn calls(locator: &RecordingLocator) -> Vec<String> {
        locator.calls.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn should_order_immediate_locators_first() {
        let mut registry = LocatorRegistry::new();
        registry
            .register(Arc::new(RecordingLocator::new("lazy", false)))
            .await
            .unwrap();
        registry
            .register(Arc::new(RecordingLocator::new("eager", true)))
            .await
            .unwrap();
        let order: Vec<_> = registry.iter().map(|l| l.item_type().to_string()).collect();
        assert_eq!(order, vec!["eager", "lazy"]);
    }

    #[tokio::test]
    async fn should_reject_second_locator_for_same_type() {
        let mut registry = LocatorRegistry::new();
        registry
            .register(Arc::new(RecordingLocator::new("lamp", false)))
            .await
            .unwrap();
        let result = registry
            .register(Arc::new(RecordingLocator::new("lamp", true)))
            .await;
        assert!(matches!(
            result,
            Err(HubError::Validation(ValidationError::DuplicateLocator { .. }))
        ));
    }

    #[tokio::test]
    async fn should_buffer_config_until_locator_registers() {
        let mut registry = LocatorRegistry::new();
        let touched = registry
            .dispatch(ConfigChange::Added(ItemConfig::new("desk", "lamp")))
            .await;
        assert!(touched.is_empty());
        assert_eq!(registry.buffered(&ItemType::from("lamp")), 1);

        let locator = Arc::new(RecordingLocator::new("lamp", false));
        registry.register(locator.clone()).await.unwrap();
        assert_eq!(calls(&locator), vec!["added:desk"]);
        assert_eq!(registry.buffered(&ItemType::from("lamp")), 0);
    }

    #[tokio::test]
    async fn should_replay_configs_to_reregistered_locator() {
        let mut registry = LocatorRegistry::new();
        let first = Arc::new(RecordingLocator::new("lamp", false));
        registry.register(first.clone()).await.unwrap();
        registry
            .dispatch(ConfigChange::Added(ItemConfig::new("desk", "lamp")))
            .await;
        registry.unregister(&ItemType::from("lamp")).unwrap();

        let second = Arc::new(RecordingLocator::new("lamp", false));
        registry.register(second.clone()).await.unwrap();
        assert_eq!(calls(&second), vec!["added:desk"]);
    }

    #[tokio::test]
    async fn should_forget_deleted_config_while_buffered() {
        let mut registry = LocatorRegistry::new();
        let config = ItemConfig::new("desk", "lamp");
        registry.dispatch(ConfigChange::Added(config.clone())).await;
        registry.dispatch(ConfigChange::Deleted(config)).await;
        assert_eq!(registry.buffered(&ItemType::from("lamp")), 0);
    }

    #[tokio::test]
    async fn should_move_config_between_locators_when_type_changes() {
        let mut registry = LocatorRegistry::new();
        let lamp = Arc::new(RecordingLocator::new("lamp", false));
        let fan = Arc::new(RecordingLocator::new("fan", false));
        registry.register(lamp.clone()).await.unwrap();
        registry.register(fan.clone()).await.unwrap();

        let touched = registry
            .dispatch(ConfigChange::Updated {
                previous: ItemConfig::new("x", "lamp"),
                current: ItemConfig::new("x", "fan"),
            })
            .await;

        assert_eq!(touched, vec![ItemType::from("lamp"), ItemType::from("fan")]);
        assert_eq!(calls(&lamp), vec!["deleted:x"]);
        assert_eq!(calls(&fan), vec!["added:x"]);
    }
}
