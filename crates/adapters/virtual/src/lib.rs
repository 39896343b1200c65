//! # itemhub-adapter-virtual
//!
//! Static locators compiled into the hub, usable without any plugin module.
//! Items are created from config files like any other item type.
//!
//! ## Provided item types
//!
//! | Item type | Init | Behaviour |
//! |-----------|------|-----------|
//! | `virtual_switch` | immediate | Boolean `on`, readable and writable |
//! | `virtual_sensor` | lazy | Stores every written reading; readings are heartbeats for its connection watchdog |
//! | `scenario` | lazy | Fires a command batch when a trigger parameter reaches a value |
//!
//! ## Dependency rule
//!
//! Depends on `itemhub-app` (port traits) and `itemhub-domain` only.

mod locator;
pub mod scenario;
pub mod sensor;
pub mod switch;

use std::sync::Arc;

use itemhub_app::ports::{HubContext, Locator};
use itemhub_app::watchdog::WatchdogSettings;

use locator::StaticLocator;
use scenario::ScenarioFactory;
use sensor::SensorFactory;
use switch::SwitchFactory;

/// Every static locator, ready to hand to the item registry.
///
/// `watchdog` is the default for sensors whose config sets no timeouts.
#[must_use]
pub fn locators(context: &HubContext, watchdog: WatchdogSettings) -> Vec<Arc<dyn Locator>> {
    let locators: [Arc<dyn Locator>; 3] = [
        Arc::new(StaticLocator::new(switch::ITEM_TYPE, true, SwitchFactory)),
        Arc::new(StaticLocator::new(
            sensor::ITEM_TYPE,
            false,
            SensorFactory { defaults: watchdog },
        )),
        Arc::new(StaticLocator::new(
            scenario::ITEM_TYPE,
            false,
            ScenarioFactory {
                context: context.clone(),
            },
        )),
    ];
    locators.into()
}
