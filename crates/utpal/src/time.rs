//! Wire timestamps.
//!
//! Packet timestamps are 32-bit microsecond counters that wrap; only
//! differences between them are meaningful. The clock is relative to
//! process start so it stays monotonic.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Current wrapping microsecond timestamp.
pub fn now_micros() -> u32 {
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u32
}

/// Elapsed microseconds from `earlier` to `later` on the wrapping clock.
#[inline]
pub fn wrapping_elapsed(later: u32, earlier: u32) -> u32 {
    later.wrapping_sub(earlier)
}
