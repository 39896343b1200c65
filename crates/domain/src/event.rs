//! Immutable records of what changed between two
//! snapshots, or of an explicit write requested from outside.

use serde::{Deserialize, Serialize};

use crate::id::{ItemId, ItemType};
use crate::time::{Timestamp, now};
use crate::value::Value;

/// What kind of change an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A parameter (or whole item) appeared.
    Added,
    /// A parameter's value changed.
    Updated,
    /// A parameter (or whole item) disappeared.
    Removed,
    /// A write was requested; not yet reflected in polled state.
    Set,
}

/// One parameter-level change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangedEvent {
    pub event_type: EventType,
    pub item_type: ItemType,
    pub item_id: ItemId,
    pub parameter: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub timestamp: Timestamp,
}

impl StateChangedEvent {
    fn build(
        event_type: EventType,
        item_type: ItemType,
        item_id: ItemId,
        parameter: impl Into<String>,
        old_value: Option<Value>,
        new_value: Option<Value>,
    ) -> Self {
        Self {
            event_type,
            item_type,
            item_id,
            parameter: parameter.into(),
            old_value,
            new_value,
            timestamp: now(),
        }
    }

    #[must_use]
    pub fn added(
        item_type: ItemType,
        item_id: ItemId,
        parameter: impl Into<String>,
        value: Value,
    ) -> Self {
        Self::build(EventType::Added, item_type, item_id, parameter, None, Some(value))
    }

    #[must_use]
    pub fn updated(
        item_type: ItemType,
        item_id: ItemId,
        parameter: impl Into<String>,
        old_value: Value,
        new_value: Value,
    ) -> Self {
        Self::build(
            EventType::Updated,
            item_type,
            item_id,
            parameter,
            Some(old_value),
            Some(new_value),
        )
    }

    #[must_use]
    pub fn removed(
        item_type: ItemType,
        item_id: ItemId,
        parameter: impl Into<String>,
        old_value: Value,
    ) -> Self {
        Self::build(EventType::Removed, item_type, item_id, parameter, Some(old_value), None)
    }

    /// An externally requested write. `old_value` is the last published value,
    /// if any.
    #[must_use]
    pub fn set(
        item_type: ItemType,
        item_id: ItemId,
        parameter: impl Into<String>,
        old_value: Option<Value>,
        new_value: Value,
    ) -> Self {
        Self::build(EventType::Set, item_type, item_id, parameter, old_value, Some(new_value))
    }

    /// Whether old and new values are deeply equal.
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        match (&self.old_value, &self.new_value) {
            (Some(old), Some(new)) => old.same_as(new),
            (None, None) => true,
            _ => false,
        }
    }
}
