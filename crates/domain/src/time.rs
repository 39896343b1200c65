//! Time and timestamp helpers.

use chrono::{DateTime, Utc};

/// UTC timestamp carried by change events and snapshots.
pub type Timestamp = DateTime<Utc>;

/// Return the current UTC time.
#[must_use]
pub fn now() -> Timestamp {
    Utc::now()
}

/// Milliseconds elapsed between `earlier` and `later`, clamped at zero.
#[must_use]
pub fn millis_between(earlier: Timestamp, later: Timestamp) -> u64 {
    u64::try_from((later - earlier).num_milliseconds()).unwrap_or(0)
}
