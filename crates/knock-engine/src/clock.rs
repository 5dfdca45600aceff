//! Wall-clock helpers for sequence derivation and rotation scheduling.
//!
//! The knock sequences are derived from `unix_seconds / 30`, so both the
//! generator and the rotator work off `SystemTime` rather than a monotonic
//! clock — agreeing with remote clients matters more than NTP-slew immunity
//! here. Timeout bookkeeping inside the engine uses `Instant` instead.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::otp::SLOT_SECONDS;

/// Current unix time in whole seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Slot index for a unix timestamp.
pub fn slot_of(unix_secs: u64) -> u64 {
    unix_secs / SLOT_SECONDS
}

/// Slot index for the current wall-clock time.
pub fn current_slot() -> u64 {
    slot_of(unix_now())
}

/// Time remaining until the next 30-second wall-clock boundary.
///
/// Sub-second precision so the rotator wakes aligned to the same grid the
/// clients derive from. Exactly on a boundary, returns a full slot.
pub fn until_next_boundary() -> Duration {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let slot_nanos = u128::from(SLOT_SECONDS) * 1_000_000_000;
    let into_slot = now.as_nanos() % slot_nanos;
    Duration::from_nanos((slot_nanos - into_slot) as u64)
}
