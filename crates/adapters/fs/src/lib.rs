//! # itemhub-adapter-fs
//!
//! Filesystem adapter: the two directories the hub watches.
//!
//! ## Provided services
//!
//! | Service | Directory | Behaviour |
//! |---------|-----------|-----------|
//! | [`ConfigWatcher`] | configs | One JSON document per item, reconciled into locator callbacks |
//! | [`ModuleLoader`] | modules | One sub-directory per plugin bundle, hot loaded and best-effort unloaded |
//!
//! ## Dependency rule
//!
//! Depends on `itemhub-app` (registry, reconciliation, module runtime port)
//! and `itemhub-domain`. The actual module runtime is injected.

pub mod config_watcher;
pub mod error;
pub mod module_loader;
mod watch;

pub use config_watcher::{ConfigWatcher, ConfigWatcherSettings};
pub use error::FsError;
pub use module_loader::{ModuleInfo, ModuleLoader, ModuleLoaderSettings, ModuleStatus};
