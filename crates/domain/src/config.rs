//! Declarative item configuration.
//!
//! Every config document describes exactly one item. Only `ItemId` and
//! `ItemType` are required; all other fields are kept as generic values and
//! decoded into typed structs by the locator that owns the item type.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;

use crate::error::ValidationError;
use crate::id::{ItemId, ItemType};
use crate::value::Value;

/// Field holding the item identifier.
pub const ITEM_ID_FIELD: &str = "ItemId";
/// Field holding the item type.
pub const ITEM_TYPE_FIELD: &str = "ItemType";

/// Immutable declarative record for one item.
///
/// Equality is deep and field-by-field, which is what reconciliation uses to
/// tell an updated config from an unchanged one.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemConfig {
    pub item_id: ItemId,
    pub item_type: ItemType,
    pub fields: BTreeMap<String, Value>,
}

impl ItemConfig {
    #[must_use]
    pub fn new(item_id: impl Into<ItemId>, item_type: impl Into<ItemType>) -> Self {
        Self {
            item_id: item_id.into(),
            item_type: item_type.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field insertion.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Extract a config from a parsed JSON document.
    ///
    /// Returns `None` when the document is not an object or when `ItemId` or
    /// `ItemType` is missing, not a string, or blank. Such documents are
    /// ignored, not treated as errors.
    #[must_use]
    pub fn from_document(document: serde_json::Value) -> Option<Self> {
        let serde_json::Value::Object(mut object) = document else {
            return None;
        };
        let item_id = take_name(&mut object, ITEM_ID_FIELD)?;
        let item_type = take_name(&mut object, ITEM_TYPE_FIELD)?;
        let fields = object
            .into_iter()
            .map(|(k, v)| (k, Value::from_json(v)))
            .collect();
        Some(Self {
            item_id: ItemId::new(item_id),
            item_type: ItemType::new(item_type),
            fields,
        })
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Render back to a JSON document, required fields included.
    #[must_use]
    pub fn to_document(&self) -> serde_json::Value {
        let mut object: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        object.insert(
            ITEM_ID_FIELD.to_string(),
            serde_json::Value::String(self.item_id.to_string()),
        );
        object.insert(
            ITEM_TYPE_FIELD.to_string(),
            serde_json::Value::String(self.item_type.to_string()),
        );
        serde_json::Value::Object(object)
    }

    /// Decode the whole document into a typed settings struct.
    ///
    /// Unknown fields are ignored; optional fields should carry
    /// `#[serde(default)]` on the target type.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::ConfigDecode`] when a field has the wrong
    /// shape or a required field is missing.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ValidationError> {
        serde_json::from_value(self.to_document()).map_err(ValidationError::ConfigDecode)
    }
}

fn take_name(object: &mut serde_json::Map<String, serde_json::Value>, key: &str) -> Option<String> {
    match object.remove(key)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s),
        _ => None,
    }
}
