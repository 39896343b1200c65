//! Turns two consecutive snapshots into change events.

use std::collections::{BTreeSet, HashMap};

use itemhub_domain::event::StateChangedEvent;
use itemhub_domain::id::ItemId;
use itemhub_domain::state::{CONNECTION_STATUS_PARAMETER, ItemState, StateKey, StatesContainer};
use itemhub_domain::value::Value;

/// Parameters per item that never generate events.
pub type UntrackedParameters = HashMap<ItemId, BTreeSet<String>>;

/// Compute the events leading from `previous` to `current`.
///
/// Items are visited in `(ItemType, ItemId)` order. Within one item the
/// events are: removed parameters, added parameters, updated parameters,
/// then the connection status update if it changed.
#[must_use]
pub fn diff(
    previous: &StatesContainer,
    current: &StatesContainer,
    untracked: &UntrackedParameters,
) -> Vec<StateChangedEvent> {
    let keys: BTreeSet<&StateKey> = previous
        .iter()
        .map(|(k, _)| k)
        .chain(current.iter().map(|(k, _)| k))
        .collect();

    let mut events = Vec::new();
    for key in keys {
        let skip = untracked.get(&key.item_id);
        let tracked = |parameter: &String| skip.is_none_or(|set| !set.contains(parameter));
        let old = state_at(previous, key);
        let new = state_at(current, key);
        match (old, new) {
            (Some(old), None) => {
                events.extend(old.parameters.iter().filter(|(p, _)| tracked(*p)).map(
                    |(parameter, value)| {
                        StateChangedEvent::removed(
                            key.item_type.clone(),
                            key.item_id.clone(),
                            parameter.clone(),
                            value.clone(),
                        )
                    },
                ));
            }
            (None, Some(new)) => {
                events.extend(new.parameters.iter().filter(|(p, _)| tracked(*p)).map(
                    |(parameter, value)| {
                        StateChangedEvent::added(
                            key.item_type.clone(),
                            key.item_id.clone(),
                            parameter.clone(),
                            value.clone(),
                        )
                    },
                ));
            }
            (Some(old), Some(new)) => diff_item(key, old, new, &tracked, &mut events),
            (None, None) => {}
        }
    }
    events
}

fn diff_item(
    key: &StateKey,
    old: &ItemState,
    new: &ItemState,
    tracked: &impl Fn(&String) -> bool,
    events: &mut Vec<StateChangedEvent>,
) {
    for (parameter, value) in &old.parameters {
        if !new.parameters.contains_key(parameter) && tracked(parameter) {
            events.push(StateChangedEvent::removed(
                key.item_type.clone(),
                key.item_id.clone(),
                parameter.clone(),
                value.clone(),
            ));
        }
    }
    for (parameter, value) in &new.parameters {
        if !old.parameters.contains_key(parameter) && tracked(parameter) {
            events.push(StateChangedEvent::added(
                key.item_type.clone(),
                key.item_id.clone(),
                parameter.clone(),
                value.clone(),
            ));
        }
    }
    for (parameter, value) in &new.parameters {
        let Some(before) = old.parameters.get(parameter) else {
            continue;
        };
        if !before.same_as(value) && tracked(parameter) {
            events.push(StateChangedEvent::updated(
                key.item_type.clone(),
                key.item_id.clone(),
                parameter.clone(),
                before.clone(),
                value.clone(),
            ));
        }
    }
    if old.connection_status != new.connection_status {
        events.push(StateChangedEvent::updated(
            key.item_type.clone(),
            key.item_id.clone(),
            CONNECTION_STATUS_PARAMETER,
            Value::String(old.connection_status.to_string()),
            Value::String(new.connection_status.to_string()),
        ));
    }
}

fn state_at<'a>(snapshot: &'a StatesContainer, key: &StateKey) -> Option<&'a ItemState> {
    (snapshot.key_of(key.item_id.as_str()) == Some(key))
        .then(|| snapshot.get(key.item_id.as_str()))
        .flatten()
}
