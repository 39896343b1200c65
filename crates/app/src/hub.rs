//! Hub façade — the public operations of the core, wired together.
//!
//! The hub owns every in-process service and exposes the operations outer
//! surfaces need. It holds no global state: the composition root builds one
//! hub and hands [`HubContext`]s to locators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use itemhub_domain::error::{Capability, HubError, NotFoundError};
use itemhub_domain::event::StateChangedEvent;
use itemhub_domain::id::SubscriberId;
use itemhub_domain::state::{ItemState, StatesContainer};
use itemhub_domain::tracking::TrackingRules;
use itemhub_domain::value::Value;

use crate::command_executor::{
    Command, CommandBatch, CommandExecutor, CommandOutcome, CommandSink, ExecutorSettings,
};
use crate::item_registry::{ItemList, ItemRegistry};
use crate::notification_bus::NotificationBus;
use crate::ports::item::unsupported;
use crate::ports::{HubContext, Item, Subscriber};
use crate::snapshot::SnapshotStore;
use crate::state_sync::{StateSynchronizer, SyncSettings};
use crate::state_transformer::{DEFAULT_TRANSFORM_TIMEOUT, StateTransformer};

/// Outcome of a write. Failures are reported, not raised.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SetValueResult {
    pub success: bool,
    pub errors: Vec<String>,
}

impl SetValueResult {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            errors: vec![error.into()],
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HubSettings {
    pub sync: SyncSettings,
    pub commands: ExecutorSettings,
    pub transform_timeout: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            sync: SyncSettings::default(),
            commands: ExecutorSettings::default(),
            transform_timeout: DEFAULT_TRANSFORM_TIMEOUT,
        }
    }
}

pub struct Hub {
    registry: Arc<ItemRegistry>,
    store: Arc<SnapshotStore>,
    bus: Arc<NotificationBus>,
    transformer: Arc<StateTransformer>,
    synchronizer: Arc<StateSynchronizer>,
    executor: CommandExecutor,
}

impl Hub {
    #[must_use]
    pub fn new(settings: HubSettings, rules: TrackingRules) -> Arc<Self> {
        let rules = Arc::new(rules);
        let registry = Arc::new(ItemRegistry::new());
        let store = Arc::new(SnapshotStore::new());
        let bus = Arc::new(NotificationBus::new(Arc::clone(&rules)));
        let transformer = Arc::new(StateTransformer::new(settings.transform_timeout));
        let synchronizer = Arc::new(StateSynchronizer::new(
            settings.sync,
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&transformer),
            rules,
        ));
        Arc::new(Self {
            registry,
            store,
            bus,
            transformer,
            synchronizer,
            executor: CommandExecutor::new(settings.commands),
        })
    }

    /// Context for locators: a weak handle back to this hub.
    #[must_use]
    pub fn context(self: &Arc<Self>) -> HubContext {
        HubContext::new(self)
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ItemRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn synchronizer(&self) -> &Arc<StateSynchronizer> {
        &self.synchronizer
    }

    /// Spawn the background loops: state poll and registry signal drain.
    pub fn spawn(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let sync = Arc::clone(&self.synchronizer);
        let sync_cancel = cancel.clone();
        let registry = Arc::clone(&self.registry);
        let registry_cancel = cancel.clone();
        vec![
            tokio::spawn(async move { sync.run(sync_cancel).await }),
            tokio::spawn(async move { registry.run(registry_cancel).await }),
        ]
    }

    /// Dispose every item and stop subscriber workers.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
        self.bus.shutdown().await;
    }

    /// Write one parameter of an item.
    ///
    /// On success a `Set` event is published and the value is kept pending
    /// until the next snapshot reflects it.
    #[tracing::instrument(skip(self, value))]
    pub async fn set_value(&self, item_id: &str, parameter: &str, value: Value) -> SetValueResult {
        match self.try_set_value(item_id, parameter, value).await {
            Ok(()) => SetValueResult::ok(),
            Err(err) => {
                tracing::warn!(%err, "set value failed");
                SetValueResult::failed(error_chain(&err))
            }
        }
    }

    async fn try_set_value(&self, item_id: &str, parameter: &str, value: Value) -> Result<(), HubError> {
        let item = self.find_item(item_id).ok_or_else(|| NotFoundError {
            entity: "item",
            id: item_id.to_string(),
        })?;
        let settable = item
            .as_settable()
            .ok_or_else(|| unsupported(item.as_ref(), Capability::Settable))?;
        settable.set_value(parameter, value.clone()).await?;

        let event = StateChangedEvent::set(
            item.item_type().clone(),
            item.item_id().clone(),
            parameter,
            self.get_value(item_id, parameter),
            value,
        );
        self.transformer.record(event.clone());
        self.bus.publish(vec![event]);
        Ok(())
    }

    #[must_use]
    pub fn get_state(&self) -> Arc<StatesContainer> {
        self.store.load()
    }

    #[must_use]
    pub fn get_item_state(&self, item_id: &str) -> Option<ItemState> {
        self.store.load().get(item_id).cloned()
    }

    #[must_use]
    pub fn get_value(&self, item_id: &str, parameter: &str) -> Option<Value> {
        self.store.load().get_value(item_id, parameter).cloned()
    }

    #[must_use]
    pub fn items(&self) -> Arc<ItemList> {
        self.registry.items()
    }

    #[must_use]
    pub fn find_item(&self, item_id: &str) -> Option<Arc<dyn Item>> {
        self.registry.find(item_id)
    }

    pub fn register_subscriber(&self, subscriber: &Arc<dyn Subscriber>) -> SubscriberId {
        self.bus.register(subscriber)
    }

    pub fn unregister_subscriber(&self, id: SubscriberId) -> bool {
        self.bus.unregister(id)
    }

    /// Deliver an event that did not come from a poll cycle.
    pub fn notify_subscribers(&self, event: StateChangedEvent) {
        self.bus.publish(vec![event]);
    }

    /// Run a command batch on behalf of `owner`; see
    /// [`CommandExecutor::execute`].
    pub async fn execute_commands(&self, owner: &str, batch: CommandBatch) -> CommandOutcome {
        self.executor.execute(owner, batch, self).await
    }

    /// Cancel the command batches still running for `owner`.
    pub fn cancel_commands(&self, owner: &str) {
        self.executor.cancel(owner);
    }
}

#[async_trait]
impl CommandSink for Hub {
    async fn dispatch(&self, command: &Command) -> Result<(), HubError> {
        let result = self
            .set_value(
                command.item_id.as_str(),
                &command.parameter,
                command.value.clone(),
            )
            .await;
        if result.success {
            Ok(())
        } else {
            Err(HubError::device_message(result.errors.join("; ")))
        }
    }
}

fn error_chain(err: &HubError) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
