//! Diff two config sets into change events.

use std::collections::BTreeMap;

use itemhub_domain::config::ItemConfig;
use itemhub_domain::id::{ItemId, ItemType};

/// Every known config, keyed by item id.
pub type ConfigSet = BTreeMap<ItemId, ItemConfig>;

/// One config change to deliver to the owning locator.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigChange {
    Added(ItemConfig),
    Updated {
        previous: ItemConfig,
        current: ItemConfig,
    },
    Deleted(ItemConfig),
}

impl ConfigChange {
    #[must_use]
    pub fn item_id(&self) -> &ItemId {
        match self {
            Self::Added(config) | Self::Deleted(config) => &config.item_id,
            Self::Updated { current, .. } => &current.item_id,
        }
    }

    #[must_use]
    pub fn item_type(&self) -> &ItemType {
        match self {
            Self::Added(config) | Self::Deleted(config) => &config.item_type,
            Self::Updated { current, .. } => &current.item_type,
        }
    }
}

/// Compare the previous pass with the current one.
///
/// Deletions come first, then additions, then updates, each in item id
/// order. A kept config only produces an update when its content differs.
#[must_use]
pub fn reconcile(previous: &ConfigSet, current: &ConfigSet) -> Vec<ConfigChange> {
    let deleted = previous
        .iter()
        .filter(|(id, _)| !current.contains_key(*id))
        .map(|(_, config)| ConfigChange::Deleted(config.clone()));
    let added = current
        .iter()
        .filter(|(id, _)| !previous.contains_key(*id))
        .map(|(_, config)| ConfigChange::Added(config.clone()));
    let updated = current.iter().filter_map(|(id, config)| {
        let old = previous.get(id)?;
        (old != config).then(|| ConfigChange::Updated {
            previous: old.clone(),
            current: config.clone(),
        })
    });
    deleted.chain(added).chain(updated).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(configs: &[ItemConfig]) -> ConfigSet {
        configs
            .iter()
            .map(|c| (c.item_id.clone(), c.clone()))
            .collect()
    }

    fn switch(id: &str, initial: bool) -> ItemConfig {
        ItemConfig::new(id, "virtual_switch").with_field("initial", initial)
    }

    #[test]
    fn should_add_once_and_never_update_unchanged_config() {
        let first = set(&[switch("hall", true)]);
        let changes = reconcile(&ConfigSet::new(), &first);
        assert_eq!(changes, vec![ConfigChange::Added(switch("hall", true))]);

        let second = set(&[switch("hall", true)]);
        assert!(reconcile(&first, &second).is_empty());
    }

    #[test]
    fn should_report_update_when_content_differs() {
        let old = set(&[switch("hall", true)]);
        let new = set(&[switch("hall", false)]);
        let changes = reconcile(&old, &new);
        assert_eq!(
            changes,
            vec![ConfigChange::Updated {
                previous: switch("hall", true),
                current: switch("hall", false),
            }]
        );
    }

    #[test]
    fn should_order_deletions_before_additions_before_updates() {
        let old = set(&[switch("a", true), switch("b", true)]);
        let new = set(&[switch("b", false), switch("c", true)]);
        let changes = reconcile(&old, &new);
        let kinds: Vec<_> = changes
            .iter()
            .map(|c| match c {
                ConfigChange::Deleted(_) => "deleted",
                ConfigChange::Added(_) => "added",
                ConfigChange::Updated { .. } => "updated",
            })
            .collect();
        assert_eq!(kinds, vec!["deleted", "added", "updated"]);
        assert_eq!(changes[0].item_id().as_str(), "a");
        assert_eq!(changes[1].item_id().as_str(), "c");
        assert_eq!(changes[2].item_id().as_str(), "b");
    }

    #[test]
    fn should_expose_item_type_of_change() {
        let change = ConfigChange::Deleted(switch("a", true));
        assert_eq!(change.item_type().as_str(), "virtual_switch");
    }
}
