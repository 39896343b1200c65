//! Common error types used across the workspace.
//!
//! Each layer defines its own typed errors and converts into [`HubError`]
//! via `#[from]` (or an explicit `into_domain`) at port boundaries.

use std::fmt;

use crate::id::{ItemId, ItemType};

/// Base error type crossing port boundaries.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// A domain invariant was violated.
    #[error("validation error")]
    Validation(#[from] ValidationError),

    /// A referenced item (or other resource) does not exist.
    #[error("not found")]
    NotFound(#[from] NotFoundError),

    /// The item exists but lacks the capability required by the operation.
    #[error("item {item_id} is not {capability}")]
    Unsupported {
        item_id: ItemId,
        capability: Capability,
    },

    /// Talking to the device (or plugin process) behind an item failed.
    #[error("device communication failed")]
    Device(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The operation did not complete in time.
    #[error("operation timed out")]
    Timeout,

    /// The operation was cancelled before completion.
    #[error("operation cancelled")]
    Cancelled,
}

impl HubError {
    /// Wrap any error as a [`HubError::Device`].
    pub fn device(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Device(Box::new(err))
    }

    /// Wrap a plain message as a [`HubError::Device`].
    pub fn device_message(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::Device(message.into())
    }
}

/// Domain invariant violations.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("item id must not be empty")]
    EmptyItemId,

    #[error("item type must not be empty")]
    EmptyItemType,

    #[error("lost timeout ({lost_ms}ms) must be greater than non-stable timeout ({non_stable_ms}ms)")]
    NonIncreasingTimeouts { non_stable_ms: u128, lost_ms: u128 },

    #[error("parameter {parameter} is not known to item")]
    UnknownParameter { parameter: String },

    #[error("cannot convert {found} into {expected}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },

    #[error("failed to decode item config")]
    ConfigDecode(#[source] serde_json::Error),

    #[error("a locator for item type {item_type} is already registered")]
    DuplicateLocator { item_type: ItemType },
}

/// A lookup did not find anything.
#[derive(Debug, thiserror::Error)]
#[error("{entity} {id} not found")]
pub struct NotFoundError {
    pub entity: &'static str,
    pub id: String,
}

/// Optional capabilities an item may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Gettable,
    Settable,
    Configurable,
    Initializable,
    Disposable,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gettable => f.write_str("gettable"),
            Self::Settable => f.write_str("settable"),
            Self::Configurable => f.write_str("configurable"),
            Self::Initializable => f.write_str("initializable"),
            Self::Disposable => f.write_str("disposable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_display_not_found_with_entity_and_id() {
        let err = NotFoundError {
            entity: "Item",
            id: "hall.light".to_string(),
        };
        assert_eq!(err.to_string(), "Item hall.light not found");
    }

    #[test]
    fn should_convert_validation_error_with_from() {
        let err: HubError = ValidationError::EmptyItemId.into();
        assert!(matches!(
            err,
            HubError::Validation(ValidationError::EmptyItemId)
        ));
    }

    #[test]
    fn should_display_unsupported_capability() {
        let err = HubError::Unsupported {
            item_id: ItemId::from("sensor.1"),
            capability: Capability::Settable,
        };
        assert_eq!(err.to_string(), "item sensor.1 is not settable");
    }

    #[test]
    fn should_keep_device_message_as_source() {
        let err = HubError::device_message("socket closed");
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "socket closed");
    }

    #[test]
    fn should_display_timeout_ordering_error() {
        let err = ValidationError::NonIncreasingTimeouts {
            non_stable_ms: 100,
            lost_ms: 50,
        };
        assert_eq!(
            err.to_string(),
            "lost timeout (50ms) must be greater than non-stable timeout (100ms)"
        );
    }
}
