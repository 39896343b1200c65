//! Port definitions — traits that adapters implement.
//!
//! Ports are the boundaries between the application core and the outside world.
//! They are defined here (in `app`) so that both the core services and the
//! adapter layer can depend on them without creating circular dependencies.
//!
//! Items and locators are stored as trait objects, so every async port uses
//! `async_trait`.

pub mod item;
pub mod locator;
pub mod module;
pub mod subscriber;

pub use item::{Configurable, Disposable, Gettable, Initializable, Item, Settable};
pub use locator::{Locator, LocatorEvent, LocatorSignal, LocatorSink};
pub use module::{HubContext, LoadedModule, ModuleRuntime};
pub use subscriber::{Subscriber, TransformOutcome, Transformable};
