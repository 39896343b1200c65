//! Subscriber and transform ports.

use async_trait::async_trait;

use itemhub_domain::error::HubError;
use itemhub_domain::event::StateChangedEvent;
use itemhub_domain::value::Value;

/// Listener of state change notifications.
///
/// Each registered subscriber gets its own delivery worker, so a slow or
/// failing subscriber never delays the others.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Item-owned subscribers receive events after tracking rules and
    /// equality suppression have been applied.
    fn filtered(&self) -> bool {
        false
    }

    /// Handle one batch of events, in emission order.
    ///
    /// # Errors
    ///
    /// Errors are logged by the bus and do not affect other subscribers.
    async fn on_state_changed(&self, events: &[StateChangedEvent]) -> Result<(), HubError>;
}

/// Answer of a transform handler for one pending `Set` event.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutcome {
    /// Apply the default coercion to the set value.
    Continue,
    /// Publish this value instead.
    Success(Value),
    /// Keep the previously published value.
    Canceled,
}

/// Handler offered every pending `Set` event of its item before the next
/// snapshot is published.
#[async_trait]
pub trait Transformable: Send + Sync {
    async fn transform(&self, event: &StateChangedEvent) -> TransformOutcome;
}
