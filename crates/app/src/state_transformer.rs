//! State transformer — rewrites polled values with in-flight writes.
//!
//! A successful `set_value` leaves a pending `Set` event keyed by
//! `(item, parameter)`; only the most recent one is kept. When the
//! synchronizer assembles the next snapshot, each pending value is offered
//! to the item's [`Transformable`](crate::ports::Transformable) handler and
//! the result replaces the polled value.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use itemhub_domain::event::StateChangedEvent;
use itemhub_domain::id::ItemId;
use itemhub_domain::state::ItemState;
use itemhub_domain::value::Value;

use crate::ports::{Item, TransformOutcome};

/// Default time a transform handler has to answer.
pub const DEFAULT_TRANSFORM_TIMEOUT: Duration = Duration::from_millis(1_000);

pub struct StateTransformer {
    timeout: Duration,
    pending: Mutex<HashMap<(ItemId, String), StateChangedEvent>>,
}

impl Default for StateTransformer {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSFORM_TIMEOUT)
    }
}

impl StateTransformer {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Remember a `Set` event, replacing any older one for the same
    /// parameter.
    pub fn record(&self, event: StateChangedEvent) {
        let key = (event.item_id.clone(), event.parameter.clone());
        self.lock().insert(key, event);
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Drop pending events of items that are gone.
    pub fn retain_items(&self, alive: impl Fn(&ItemId) -> bool) {
        self.lock().retain(|(item_id, _), _| alive(item_id));
    }

    /// Apply every pending event of `item` to its freshly polled `state`.
    ///
    /// `previous` is the state published in the last snapshot. Pending
    /// events are consumed.
    pub async fn apply(
        &self,
        item: &dyn Item,
        previous: Option<&ItemState>,
        mut state: ItemState,
    ) -> ItemState {
        let pending = self.take(item.item_id());
        for event in pending {
            let Some(raw) = event.new_value.clone() else {
                continue;
            };
            let before = previous.and_then(|p| p.get(&event.parameter));
            let outcome = match item.as_transformable() {
                Some(handler) => {
                    match tokio::time::timeout(self.timeout, handler.transform(&event)).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            tracing::warn!(
                                item_id = %event.item_id,
                                parameter = %event.parameter,
                                "transform handler timed out, publishing raw value"
                            );
                            TransformOutcome::Success(raw.clone())
                        }
                    }
                }
                None => TransformOutcome::Continue,
            };
            let value = match outcome {
                TransformOutcome::Success(value) => Some(value),
                TransformOutcome::Continue => coerce(&event, raw, before),
                TransformOutcome::Canceled => before.cloned(),
            };
            if let Some(value) = value {
                state.parameters.insert(event.parameter, value);
            }
        }
        state
    }

    fn take(&self, item_id: &ItemId) -> Vec<StateChangedEvent> {
        let mut pending = self.lock();
        let keys: Vec<(ItemId, String)> = pending
            .keys()
            .filter(|(id, _)| id == item_id)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| pending.remove(&key))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(ItemId, String), StateChangedEvent>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Convert the set value into the runtime type of the published one.
///
/// Without a published value the raw value is used; a failed conversion
/// keeps the published value.
fn coerce(event: &StateChangedEvent, raw: Value, before: Option<&Value>) -> Option<Value> {
    let Some(before) = before else {
        return Some(raw);
    };
    match raw.coerce_like(before) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                %err,
                item_id = %event.item_id,
                parameter = %event.parameter,
                "cannot coerce set value, keeping previous value"
            );
            Some(before.clone())
        }
    }
}
