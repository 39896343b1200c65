//! JSON-lines wire protocol between the hub and a plugin process.
//!
//! Every line is one JSON object. The hub sends requests tagged by `op`
//! and carrying a numeric `id`; the plugin answers each with a line holding
//! the same `id` and either a `result` or an `error`. The plugin may also
//! write unsolicited messages, tagged by `event`, at any time.
//!
//! ```text
//! -> {"id":1,"op":"hello","protocol":1}
//! <- {"id":1,"result":{"locators":[{"item_type":"lamp","immediate_init":false}]}}
//! -> {"id":2,"op":"get_state","item_id":"kitchen"}
//! <- {"event":"log","level":"info","message":"polling kitchen"}
//! <- {"id":2,"result":{"connection_status":"Stable","parameters":{"on":true}}}
//! ```

use serde::{Deserialize, Serialize};

use itemhub_domain::id::{ItemId, ItemType};
use itemhub_domain::value::Value;

pub const PROTOCOL_VERSION: u32 = 1;

/// Hub to plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Hello {
        protocol: u32,
    },
    ConfigAdded {
        config: serde_json::Value,
    },
    ConfigUpdated {
        config: serde_json::Value,
    },
    ConfigDeleted {
        item_id: ItemId,
    },
    Initialize {
        item_id: ItemId,
    },
    GetState {
        item_id: ItemId,
    },
    SetValue {
        item_id: ItemId,
        parameter: String,
        value: Value,
    },
    Dispose {
        item_id: ItemId,
    },
    Shutdown,
}

impl Request {
    /// Operation name, as written on the wire.
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::ConfigAdded { .. } => "config_added",
            Self::ConfigUpdated { .. } => "config_updated",
            Self::ConfigDeleted { .. } => "config_deleted",
            Self::Initialize { .. } => "initialize",
            Self::GetState { .. } => "get_state",
            Self::SetValue { .. } => "set_value",
            Self::Dispose { .. } => "dispose",
            Self::Shutdown => "shutdown",
        }
    }
}

/// A request with its correlation id, as written on the wire.
#[derive(Debug, Serialize)]
pub(crate) struct Envelope<'a> {
    pub id: u64,
    #[serde(flatten)]
    pub request: &'a Request,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

/// Plugin to hub, outside any request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    /// The plugin discovered an item on its own.
    ItemAdded { item_type: ItemType, item_id: ItemId },
    ItemDeleted { item_type: ItemType, item_id: ItemId },
    /// A parameter changed on the device side.
    Notify {
        item_id: ItemId,
        parameter: String,
        value: Value,
    },
    Log { level: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub(crate) enum Incoming {
    Response(Response),
    Notification(Notification),
}

/// One locator announced during the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatorSpec {
    pub item_type: ItemType,
    #[serde(default)]
    pub immediate_init: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    #[serde(default)]
    pub locators: Vec<LocatorSpec>,
}
