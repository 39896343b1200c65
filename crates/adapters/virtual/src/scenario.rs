//! Scenario — an item that listens to state changes and fires a command
//! batch when its trigger matches.
//!
//! A scenario subscribes itself to the bus when initialized and leaves it
//! when disposed. The trigger is one `(item, parameter, value)` triple;
//! only polled changes (Added or Updated) fire it, never the `Set` events
//! written by other scenarios.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde::Deserialize;

use itemhub_app::command_executor::{Command, CommandBatch, CommandOutcome};
use itemhub_app::ports::{
    Configurable, Disposable, Gettable, HubContext, Initializable, Item, Settable, Subscriber,
};
use itemhub_domain::config::ItemConfig;
use itemhub_domain::error::{HubError, ValidationError};
use itemhub_domain::event::{EventType, StateChangedEvent};
use itemhub_domain::id::{ItemId, ItemType, SubscriberId};
use itemhub_domain::state::{ConnectionStatus, ItemState};
use itemhub_domain::value::Value;

use crate::locator::ItemFactory;

pub const ITEM_TYPE: &str = "scenario";
pub const ENABLED_PARAMETER: &str = "enabled";
pub const RUNS_PARAMETER: &str = "runs";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ScenarioConfig {
    trigger_item: String,
    trigger_parameter: String,
    trigger_value: Value,
    #[serde(default)]
    commands: Vec<CommandConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CommandConfig {
    item_id: String,
    parameter: String,
    value: Value,
}

impl ScenarioConfig {
    fn matches(&self, event: &StateChangedEvent) -> bool {
        matches!(event.event_type, EventType::Added | EventType::Updated)
            && event.item_id.as_str() == self.trigger_item
            && event.parameter == self.trigger_parameter
            && event
                .new_value
                .as_ref()
                .is_some_and(|v| v.same_as(&self.trigger_value))
    }

    fn batch(&self, name: &ItemId) -> CommandBatch {
        let commands = self
            .commands
            .iter()
            .map(|c| Command::new(c.item_id.as_str(), c.parameter.as_str(), c.value.clone()))
            .collect();
        CommandBatch::new(name.as_str(), commands)
    }
}

pub struct Scenario {
    item_id: ItemId,
    item_type: ItemType,
    context: HubContext,
    me: Weak<Scenario>,
    config: Mutex<ScenarioConfig>,
    enabled: AtomicBool,
    runs: AtomicU64,
    subscription: Mutex<Option<SubscriberId>>,
}

impl Scenario {
    fn create(config: &ItemConfig, context: HubContext) -> Result<Arc<Self>, HubError> {
        let settings: ScenarioConfig = config.decode()?;
        Ok(Arc::new_cyclic(|me| Self {
            item_id: config.item_id.clone(),
            item_type: config.item_type.clone(),
            context,
            me: me.clone(),
            config: Mutex::new(settings),
            enabled: AtomicBool::new(true),
            runs: AtomicU64::new(0),
            subscription: Mutex::new(None),
        }))
    }

    #[must_use]
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    fn settings(&self) -> std::sync::MutexGuard<'_, ScenarioConfig> {
        self.config
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn subscription(&self) -> std::sync::MutexGuard<'_, Option<SubscriberId>> {
        self.subscription
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Item for Scenario {
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

    fn as_initializable(&self) -> Option<&dyn Initializable> {
        Some(self)
    }

    fn as_disposable(&self) -> Option<&dyn Disposable> {
        Some(self)
    }
}

#[async_trait]
impl Gettable for Scenario {
    async fn get_state(&self) -> Result<ItemState, HubError> {
        let runs = i64::try_from(self.runs()).unwrap_or(i64::MAX);
        Ok(ItemState::new(ConnectionStatus::Stable)
            .with(ENABLED_PARAMETER, self.enabled.load(Ordering::SeqCst))
            .with(RUNS_PARAMETER, runs))
    }
}

#[async_trait]
impl Settable for Scenario {
    async fn set_value(&self, parameter: &str, value: Value) -> Result<(), HubError> {
        if parameter != ENABLED_PARAMETER {
            return Err(ValidationError::UnknownParameter {
                parameter: parameter.to_string(),
            }
            .into());
        }
        let enabled = value.as_bool().ok_or_else(|| ValidationError::TypeMismatch {
            expected: "bool",
            found: value.type_name().to_string(),
        })?;
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Configurable for Scenario {
    async fn configure(&self, config: &ItemConfig) -> Result<(), HubError> {
        let settings: ScenarioConfig = config.decode()?;
        *self.settings() = settings;
        Ok(())
    }
}

#[async_trait]
impl Initializable for Scenario {
    async fn initialize(&self) -> Result<(), HubError> {
        let Some(me) = self.me.upgrade() else {
            return Err(HubError::Cancelled);
        };
        let subscriber: Arc<dyn Subscriber> = me;
        let id = self.context.register_subscriber(&subscriber)?;
        if let Some(previous) = self.subscription().replace(id) {
            self.context.unregister_subscriber(previous);
        }
        Ok(())
    }
}

#[async_trait]
impl Disposable for Scenario {
    async fn dispose(&self) -> Result<(), HubError> {
        if let Some(id) = self.subscription().take() {
            self.context.unregister_subscriber(id);
        }
        Ok(())
    }
}

#[async_trait]
impl Subscriber for Scenario {
    fn name(&self) -> &str {
        self.item_id.as_str()
    }

    fn filtered(&self) -> bool {
        true
    }

    async fn on_state_changed(&self, events: &[StateChangedEvent]) -> Result<(), HubError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        let batch = {
            let settings = self.settings();
            if !events.iter().any(|e| settings.matches(e)) {
                return Ok(());
            }
            settings.batch(&self.item_id)
        };
        tracing::info!(scenario = %self.item_id, commands = batch.commands.len(), "scenario triggered");
        self.runs.fetch_add(1, Ordering::SeqCst);
        match self
            .context
            .execute_commands(self.item_id.as_str(), batch)
            .await?
        {
            CommandOutcome::Completed { tries } => {
                tracing::debug!(scenario = %self.item_id, tries, "scenario commands completed");
            }
            CommandOutcome::Exhausted { tries, failed } => {
                tracing::warn!(
                    scenario = %self.item_id,
                    tries,
                    failed = failed.len(),
                    "scenario commands exhausted"
                );
            }
            CommandOutcome::Cancelled => {
                tracing::debug!(scenario = %self.item_id, "scenario commands cancelled");
            }
        }
        Ok(())
    }
}

pub(crate) struct ScenarioFactory {
    pub(crate) context: HubContext,
}

impl ItemFactory for ScenarioFactory {
    type Item = Scenario;

    fn create(&self, config: &ItemConfig) -> Result<Arc<Scenario>, HubError> {
        Scenario::create(config, self.context.clone())
    }
}
