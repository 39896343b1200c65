//! Lock-free holder of the current global snapshot.

use std::sync::Arc;

use arc_swap::ArcSwap;

use itemhub_domain::state::StatesContainer;

/// Publishes [`StatesContainer`]s by whole-value replacement.
///
/// Readers get an `Arc` to the snapshot current at the time of the call and
/// keep a consistent view for as long as they hold it.
#[derive(Debug)]
pub struct SnapshotStore {
    current: ArcSwap<StatesContainer>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(StatesContainer::default()),
        }
    }

    #[must_use]
    pub fn load(&self) -> Arc<StatesContainer> {
        self.current.load_full()
    }

    /// Swap in a new snapshot and return the one it replaced.
    pub fn publish(&self, snapshot: StatesContainer) -> Arc<StatesContainer> {
        self.current.swap(Arc::new(snapshot))
    }
}
