//! End-to-end tests for the wired hub.
//!
//! Each test builds a real hub, feeds it item configs through the
//! filesystem config watcher (backed by a temporary directory) and checks
//! what the registry and the snapshot end up holding.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use itemhub_adapter_fs::config_watcher::{ConfigWatcher, ConfigWatcherSettings};
use itemhub_app::hub::{Hub, HubSettings};
use itemhub_app::ports::{Initializable, Item, Locator};
use itemhub_app::watchdog::WatchdogSettings;
use itemhub_domain::config::ItemConfig;
use itemhub_domain::error::HubError;
use itemhub_domain::id::{ItemId, ItemType};
use itemhub_domain::tracking::TrackingRules;
use itemhub_domain::value::Value;

type Journal = Arc<Mutex<Vec<String>>>;

struct JournalItem {
    item_id: ItemId,
    item_type: ItemType,
    journal: Journal,
}

impl Item for JournalItem {
    fn item_id(&self) -> &ItemId {
        &self.item_id
    }

    fn item_type(&self) -> &ItemType {
        &self.item_type
    }

    fn as_initializable(&self) -> Option<&dyn Initializable> {
        Some(self)
    }
}

#[async_trait]
impl Initializable for JournalItem {
    async fn initialize(&self) -> Result<(), HubError> {
        self.journal.lock().unwrap().push(self.item_id.to_string());
        Ok(())
    }
}

/// Locator building one [`JournalItem`] per config.
struct JournalLocator {
    item_type: ItemType,
    immediate: bool,
    journal: Journal,
    items: Mutex<Vec<Arc<JournalItem>>>,
}

impl JournalLocator {
    fn new(item_type: &str, immediate: bool, journal: &Journal) -> Arc<dyn Locator> {
        Arc::new(Self {
            item_type: ItemType::from(item_type),
            immediate,
            journal: Arc::clone(journal),
            items: Mutex::new(Vec::new()),
        })
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
        self.items
            .lock()
            .unwrap()
            .iter()
            .map(|item| Arc::clone(item) as Arc<dyn Item>)
            .collect()
    }

    async fn config_added(&self, config: ItemConfig) -> Result<(), HubError> {
        self.items.lock().unwrap().push(Arc::new(JournalItem {
            item_id: config.item_id,
            item_type: self.item_type.clone(),
            journal: Arc::clone(&self.journal),
        }));
        Ok(())
    }

    async fn config_updated(&self, _config: ItemConfig) -> Result<(), HubError> {
        Ok(())
    }

    async fn config_deleted(&self, item_id: &ItemId) -> Result<(), HubError> {
        self.items
            .lock()
            .unwrap()
            .retain(|item| &item.item_id != item_id);
        Ok(())
    }
}

fn write_config(dir: &Path, file: &str, document: &serde_json::Value) {
    std::fs::write(dir.join(file), document.to_string()).unwrap();
}

fn watcher(hub: &Arc<Hub>, dir: &Path) -> ConfigWatcher {
    ConfigWatcher::new(ConfigWatcherSettings::new(dir), Arc::clone(hub.registry()))
}

#[tokio::test]
async fn should_initialize_immediate_items_before_lazy_ones() {
    let configs = tempfile::tempdir().unwrap();
    // the lazy item sorts first on disk
    write_config(
        configs.path(),
        "a-thermometer.json",
        &serde_json::json!({"ItemId": "attic", "ItemType": "thermometer"}),
    );
    write_config(
        configs.path(),
        "b-gateway.json",
        &serde_json::json!({"ItemId": "gateway", "ItemType": "bridge"}),
    );
    let journal: Journal = Arc::default();
    let hub = Hub::new(HubSettings::default(), TrackingRules::default());
    hub.registry()
        .start(vec![
            JournalLocator::new("thermometer", false, &journal),
            JournalLocator::new("bridge", true, &journal),
        ])
        .await;

    let changes = watcher(&hub, configs.path()).scan().await.unwrap();

    assert_eq!(changes.len(), 2);
    let items = hub.registry().items();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].item_id().as_str(), "gateway");
    assert_eq!(items[1].item_id().as_str(), "attic");
    assert_eq!(*journal.lock().unwrap(), vec!["gateway", "attic"]);
}

#[tokio::test]
async fn should_drop_item_when_its_config_file_goes_away() {
    let configs = tempfile::tempdir().unwrap();
    write_config(
        configs.path(),
        "gateway.json",
        &serde_json::json!({"ItemId": "gateway", "ItemType": "bridge"}),
    );
    let journal: Journal = Arc::default();
    let hub = Hub::new(HubSettings::default(), TrackingRules::default());
    hub.registry()
        .start(vec![JournalLocator::new("bridge", true, &journal)])
        .await;
    let watcher = watcher(&hub, configs.path());
    watcher.scan().await.unwrap();
    assert_eq!(hub.registry().items().len(), 1);

    std::fs::remove_file(configs.path().join("gateway.json")).unwrap();
    watcher.scan().await.unwrap();

    assert!(hub.registry().items().is_empty());
    assert!(hub.find_item("gateway").is_none());
}

#[tokio::test]
async fn should_drive_virtual_switch_from_config_file() {
    let configs = tempfile::tempdir().unwrap();
    write_config(
        configs.path(),
        "hall.json",
        &serde_json::json!({"ItemId": "hall", "ItemType": "virtual_switch", "InitialOn": false}),
    );
    let hub = Hub::new(HubSettings::default(), TrackingRules::default());
    let context = hub.context();
    hub.registry()
        .start(itemhub_adapter_virtual::locators(
            &context,
            WatchdogSettings::default(),
        ))
        .await;
    watcher(&hub, configs.path()).scan().await.unwrap();
    hub.synchronizer().sync_once().await;
    assert_eq!(hub.get_value("hall", "on"), Some(Value::Bool(false)));

    let result = hub.set_value("hall", "on", Value::Bool(true)).await;
    hub.synchronizer().sync_once().await;

    assert!(result.success);
    assert_eq!(hub.get_value("hall", "on"), Some(Value::Bool(true)));
    hub.shutdown().await;
    assert!(hub.registry().items().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn should_register_locators_of_plugin_bundle() {
    use std::os::unix::fs::PermissionsExt;

    use itemhub_adapter_fs::module_loader::{ModuleLoader, ModuleLoaderSettings, ModuleStatus};
    use itemhub_adapter_plugin_process::{ProcessRuntime, ProcessSettings};
    use tokio_util::sync::CancellationToken;

    let root = tempfile::tempdir().unwrap();
    let bundle = root.path().join("modules").join("echo");
    std::fs::create_dir_all(&bundle).unwrap();
    let plugin = bundle.join("echo.plugin");
    std::fs::write(
        &plugin,
        "#!/bin/sh\n\
         read line\n\
         echo '{\"id\":1,\"result\":{\"locators\":[{\"item_type\":\"echo\"}]}}'\n\
         cat > /dev/null\n",
    )
    .unwrap();
    std::fs::set_permissions(&plugin, std::fs::Permissions::from_mode(0o755)).unwrap();

    let hub = Hub::new(HubSettings::default(), TrackingRules::default());
    let loader = ModuleLoader::new(
        ModuleLoaderSettings::new(root.path().join("modules"), root.path().join("staging")),
        Arc::new(ProcessRuntime::new(ProcessSettings::default())),
        Arc::clone(hub.registry()),
        hub.context(),
    );

    loader.scan(&CancellationToken::new()).await.unwrap();

    assert_eq!(
        hub.registry().locator_types().await,
        vec![ItemType::from("echo")]
    );
    let modules = loader.modules();
    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0].status, ModuleStatus::Resident);
}
