//! Per-item tracking rules.
//!
//! Rules decide which parameters stay out of the snapshot (uncached) and
//! which events never reach item-owned subscribers (untracked).

use std::collections::{BTreeSet, HashMap};

use crate::event::{EventType, StateChangedEvent};
use crate::id::ItemId;

/// Which parameters of an untracked item are suppressed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ParameterScope {
    /// Every parameter of the item.
    #[default]
    All,
    /// Only the listed parameters.
    Only(BTreeSet<String>),
}

impl ParameterScope {
    #[must_use]
    pub fn covers(&self, parameter: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(parameters) => parameters.contains(parameter),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrackingRules {
    untracked: HashMap<ItemId, ParameterScope>,
    uncached: HashMap<ItemId, BTreeSet<String>>,
}

impl TrackingRules {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an item untracked, either entirely or for some parameters.
    #[must_use]
    pub fn untrack(mut self, item_id: impl Into<ItemId>, scope: ParameterScope) -> Self {
        self.untracked.insert(item_id.into(), scope);
        self
    }

    /// Exclude parameters of an item from the published snapshot.
    #[must_use]
    pub fn uncache<I, S>(mut self, item_id: impl Into<ItemId>, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.uncached
            .entry(item_id.into())
            .or_default()
            .extend(parameters.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn uncached_parameters(&self, item_id: &str) -> Option<&BTreeSet<String>> {
        self.uncached.get(item_id).filter(|set| !set.is_empty())
    }

    /// Whether `event` must not be delivered to filtered subscribers.
    ///
    /// Untracked items are dropped first. `Set` events are never subject to
    /// equality suppression; every other event with equal old and new value
    /// is dropped.
    #[must_use]
    pub fn suppresses(&self, event: &StateChangedEvent) -> bool {
        if let Some(scope) = self.untracked.get(&event.item_id) {
            if scope.covers(&event.parameter) {
                return true;
            }
        }
        event.event_type != EventType::Set && event.is_unchanged()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.untracked.is_empty() && self.uncached.is_empty()
    }
}
