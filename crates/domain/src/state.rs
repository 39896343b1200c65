//! Item state and the immutable global snapshot.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::{ItemId, ItemType};
use crate::time::{Timestamp, now};
use crate::value::Value;

/// Name under which a connection status change is reported in events.
pub const CONNECTION_STATUS_PARAMETER: &str = "ConnectionStatus";

/// Health classification of the link between the hub and an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Stable,
    Unstable,
    Lost,
}

impl ConnectionStatus {
    /// Whether the item is currently considered reachable.
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Stable | Self::Unstable)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("Unknown"),
            Self::Stable => f.write_str("Stable"),
            Self::Unstable => f.write_str("Unstable"),
            Self::Lost => f.write_str("Lost"),
        }
    }
}

/// State reported by one item for one poll cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ItemState {
    pub connection_status: ConnectionStatus,
    pub parameters: BTreeMap<String, Value>,
}

impl ItemState {
    /// Empty state with the given connection status.
    #[must_use]
    pub fn new(connection_status: ConnectionStatus) -> Self {
        Self {
            connection_status,
            parameters: BTreeMap::new(),
        }
    }

    /// Builder-style parameter insertion.
    #[must_use]
    pub fn with(mut self, parameter: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(parameter.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, parameter: &str) -> Option<&Value> {
        self.parameters.get(parameter)
    }

    /// Copy of this state without the listed parameters.
    #[must_use]
    pub fn without<'a>(&self, parameters: impl IntoIterator<Item = &'a String>) -> Self {
        let mut copy = self.clone();
        for parameter in parameters {
            copy.parameters.remove(parameter);
        }
        copy
    }
}

/// Sort key of a snapshot entry: items are ordered by type, then id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateKey {
    pub item_type: ItemType,
    pub item_id: ItemId,
}

impl StateKey {
    #[must_use]
    pub fn new(item_type: ItemType, item_id: ItemId) -> Self {
        Self { item_type, item_id }
    }
}

/// One immutable, whole-system view of every gettable item's state.
///
/// A container is never modified after construction; the synchronizer
/// builds a new one every cycle and swaps it in.
#[derive(Debug, Clone, Default)]
pub struct StatesContainer {
    taken_at: Option<Timestamp>,
    states: BTreeMap<StateKey, ItemState>,
    index: HashMap<ItemId, StateKey>,
}

impl StatesContainer {
    /// Build a snapshot from `(type, id, state)` triples.
    ///
    /// When the same item id appears twice the last entry wins.
    pub fn from_states(entries: impl IntoIterator<Item = (ItemType, ItemId, ItemState)>) -> Self {
        let mut states = BTreeMap::new();
        let mut index = HashMap::new();
        for (item_type, item_id, state) in entries {
            let key = StateKey::new(item_type, item_id.clone());
            if let Some(previous) = index.insert(item_id, key.clone()) {
                states.remove(&previous);
            }
            states.insert(key, state);
        }
        Self {
            taken_at: Some(now()),
            states,
            index,
        }
    }

    /// When the snapshot was assembled (`None` for the initial empty one).
    #[must_use]
    pub fn taken_at(&self) -> Option<Timestamp> {
        self.taken_at
    }

    #[must_use]
    pub fn get(&self, item_id: &str) -> Option<&ItemState> {
        let key = self.index.get(item_id)?;
        self.states.get(key)
    }

    #[must_use]
    pub fn get_value(&self, item_id: &str, parameter: &str) -> Option<&Value> {
        self.get(item_id)?.get(parameter)
    }

    #[must_use]
    pub fn key_of(&self, item_id: &str) -> Option<&StateKey> {
        self.index.get(item_id)
    }

    /// Entries in `(ItemType, ItemId)` order.
    pub fn iter(&self) -> impl Iterator<Item = (&StateKey, &ItemState)> {
        self.states.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
