//! Plugin process adapter error types.

use itemhub_domain::error::HubError;

/// Errors specific to the plugin process adapter.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The plugin executable could not be started.
    #[error("failed to spawn plugin process")]
    Spawn(#[source] std::io::Error),

    /// Writing to the plugin's stdin failed.
    #[error("failed to write to plugin")]
    Io(#[source] std::io::Error),

    /// A request could not be serialized.
    #[error("failed to encode plugin request")]
    Encode(#[source] serde_json::Error),

    /// A response did not have the expected shape.
    #[error("failed to decode plugin response")]
    Decode(#[source] serde_json::Error),

    /// No response arrived within the request timeout.
    #[error("plugin did not answer {op} in time")]
    Timeout { op: &'static str },

    /// The plugin closed its output; the process is gone.
    #[error("plugin process closed")]
    Closed,

    /// The plugin answered with an error.
    #[error("plugin error: {0}")]
    Remote(String),

    /// The plugin announced no locator during the handshake.
    #[error("plugin exposes no locator")]
    NoLocator,

    /// A domain-level error.
    #[error("domain error")]
    Domain(#[source] HubError),
}

impl PluginError {
    /// Convert into a [`HubError`] for propagation across port boundaries.
    pub fn into_domain(self) -> HubError {
        match self {
            Self::Domain(err) => err,
            Self::Timeout { .. } => HubError::Timeout,
            Self::Remote(message) => HubError::device_message(message),
            other => HubError::device(other),
        }
    }
}

impl From<PluginError> for HubError {
    fn from(err: PluginError) -> Self {
        err.into_domain()
    }
}
