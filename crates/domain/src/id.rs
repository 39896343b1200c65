//! Typed identifier newtypes.
//!
//! Items are identified by human-chosen strings coming from their config
//! files ([`ItemId`], [`ItemType`]). Runtime-only handles such as a module's
//! load identity are random UUIDs.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[doc = $doc:expr])* $name:ident) => {
        $(#[doc = $doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(uuid::Uuid);

        impl Default for $name {
            fn default() -> Self {
                Self(uuid::Uuid::new_v4())
            }
        }

        impl $name {
            /// Generate a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self::default()
            }

            /// Access the inner UUID.
            #[must_use]
            pub fn as_uuid(self) -> uuid::Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                uuid::Uuid::parse_str(s).map(Self)
            }
        }
    };
}

macro_rules! define_name {
    ($(#[doc = $doc:expr])* $name:ident) => {
        $(#[doc = $doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a string.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the inner string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the name is empty or whitespace only.
            #[must_use]
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

define_name!(
    /// Unique identifier of an item, as written in its config (`ItemId`).
    ItemId
);

define_name!(
    /// Category of an item (`ItemType`); exactly one locator exists per type.
    ItemType
);

define_id!(
    /// Load identity of a plugin module. A fresh id is minted for every load,
    /// so a reloaded bundle never shares an id with its predecessor.
    ModuleId
);

define_id!(
    /// Handle returned when a subscriber registers on the notification bus.
    SubscriberId
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn should_generate_unique_ids_when_called_twice() {
        let a = ModuleId::new();
        let b = ModuleId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn should_key_ordered_maps_by_subscriber_id() {
        let a = SubscriberId::new();
        let b = SubscriberId::new();
        let mut map = std::collections::BTreeMap::new();
        map.insert(a, "a");
        map.insert(b, "b");

        assert_eq!(map.remove(&a), Some("a"));
        assert_eq!(map.len(), 1);
        assert_eq!(a.cmp(&b), a.as_uuid().cmp(&b.as_uuid()));
    }

    #[test]
    fn should_roundtrip_through_display_and_from_str() {
        let id = SubscriberId::new();
        let text = id.to_string();
        let parsed: SubscriberId = text.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn should_return_error_when_parsing_invalid_uuid() {
        let result = ModuleId::from_str("not-a-uuid");
        assert!(result.is_err());
    }

    #[test]
    fn should_serialize_item_id_as_plain_string() {
        let id = ItemId::new("kitchen.light");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"kitchen.light\"");
    }

    #[test]
    fn should_lookup_item_id_by_str_in_hash_set() {
        let set: HashSet<ItemId> = [ItemId::from("a"), ItemId::from("b")].into_iter().collect();
        assert!(set.contains("a"));
        assert!(!set.contains("c"));
    }

    #[test]
    fn should_report_blank_names() {
        assert!(ItemType::new("  ").is_blank());
        assert!(!ItemType::new("thermostat").is_blank());
    }

    #[test]
    fn should_order_item_types_lexicographically() {
        assert!(ItemType::from("a_sensor") < ItemType::from("b_switch"));
    }
}
