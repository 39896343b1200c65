//! # itemhub-app
//!
//! Application layer — **port definitions** (traits) and the in-process core.
//!
//! ## Responsibilities
//! - Define **port traits** that adapters implement:
//!   - `Item` and its optional capabilities (`Gettable`, `Settable`,
//!     `Configurable`, `Initializable`, `Disposable`, `Transformable`)
//!   - `Locator`: factory and lifecycle owner of every item of one type
//!   - `Subscriber`: listener of state change events
//!   - `ModuleRuntime`: turns a plugin library file into locators
//! - Provide the **in-process core services**:
//!   - config reconciliation and the locator / item registries
//!   - the state synchronizer, snapshot store and snapshot diff
//!   - the notification bus and the state transformer
//!   - the command executor and the connection watchdog
//!   - the `Hub` façade tying them together
//!
//! ## Dependency rule
//! Depends on `itemhub-domain` only (plus tokio and a few concurrency
//! helpers). Never imports adapter crates. Adapters depend on *this* crate,
//! not the reverse.

pub mod command_executor;
pub mod diff;
pub mod hub;
pub mod item_registry;
pub mod locator_registry;
pub mod notification_bus;
pub mod ports;
pub mod reconcile;
pub mod snapshot;
pub mod state_sync;
pub mod state_transformer;
pub mod watchdog;
