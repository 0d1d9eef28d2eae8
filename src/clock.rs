//! Sensor clock and relative-to-absolute tick conversion.
//!
//! Sensors stamp frames in 100 ns ticks of a monotonic clock. The wire carries
//! absolute ticks (100 ns since 1601-01-01, the FILETIME epoch), which lets a
//! receiver line frames from different sensors up against wall time.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// 100 ns ticks per second.
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// Ticks between 1601-01-01 and 1970-01-01.
pub const FILETIME_UNIX_OFFSET_TICKS: u64 = 116_444_736_000_000_000;

static CLOCK_ORIGIN: OnceLock<Instant> = OnceLock::new();

fn origin() -> Instant {
    *CLOCK_ORIGIN.get_or_init(Instant::now)
}

/// Current reading of the monotonic sensor clock.
pub fn monotonic_ticks() -> u64 {
    let elapsed = origin().elapsed();
    elapsed.as_secs() * TICKS_PER_SECOND + u64::from(elapsed.subsec_nanos()) / 100
}

/// Wall-clock time in absolute ticks.
pub fn absolute_now_ticks() -> u64 {
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    FILETIME_UNIX_OFFSET_TICKS
        + since_unix.as_secs() * TICKS_PER_SECOND
        + u64::from(since_unix.subsec_nanos()) / 100
}

/// Converts relative sensor ticks to absolute ticks using an offset anchored
/// once at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickConverter {
    offset_ticks: u64,
}

impl TickConverter {
    pub fn with_offset(offset_ticks: u64) -> Self {
        Self { offset_ticks }
    }

    /// Anchor the monotonic sensor clock against the system clock.
    pub fn from_system_clock() -> Self {
        let relative = monotonic_ticks();
        let absolute = absolute_now_ticks();
        Self::with_offset(absolute.saturating_sub(relative))
    }

    pub fn to_absolute(&self, relative_ticks: u64) -> u64 {
        relative_ticks.saturating_add(self.offset_ticks)
    }
}

impl Default for TickConverter {
    fn default() -> Self {
        Self::from_system_clock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_ticks_never_decrease() {
        let a = monotonic_ticks();
        let b = monotonic_ticks();
        assert!(b >= a);
    }

    #[test]
    fn converter_adds_offset() {
        let converter = TickConverter::with_offset(1_000);
        assert_eq!(converter.to_absolute(5), 1_005);
    }

    #[test]
    fn system_anchor_lands_after_unix_epoch() {
        let converter = TickConverter::from_system_clock();
        let absolute = converter.to_absolute(monotonic_ticks());
        assert!(absolute > FILETIME_UNIX_OFFSET_TICKS);
    }
}
