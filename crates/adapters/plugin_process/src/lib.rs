//! # itemhub-adapter-plugin-process
//!
//! [`ModuleRuntime`](itemhub_app::ports::ModuleRuntime) running every plugin
//! library as a child process.
//!
//! A plugin is any executable with a recognized extension (`.plugin` by
//! default). The hub starts it with the bundle's staging directory as its
//! working directory, then talks to it with JSON lines on stdin/stdout (see
//! [`protocol`]). Standard error is inherited.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`channel::PluginChannel`] | request/response correlation, timeouts |
//! | [`runtime::ProcessRuntime`] | spawn, handshake, notification pump |
//! | [`locator::RemoteLocator`] | forwards config changes to the plugin |
//! | [`item::RemoteItem`] | forwards capability calls, owns a watchdog |

pub mod channel;
pub mod error;
pub mod item;
pub mod locator;
pub mod protocol;
pub mod runtime;

pub use error::PluginError;
pub use runtime::{ProcessRuntime, ProcessSettings};
