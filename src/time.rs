//! Monotonic kernel time.
//!
//! A 32-bit tick counter bumped by the periodic timer interrupt at
//! [`HZ`](crate::config::HZ). Everything time-based in the kernel is
//! expressed in ticks; millisecond conversion happens at the API edge.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::HZ;

static TICKS: AtomicU32 = AtomicU32::new(0);

pub fn ticks() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

pub fn ms_to_ticks(ms: u32) -> u32 {
    // Round up so a nonzero delay never becomes zero ticks.
    (ms * HZ + 999) / 1000
}

pub fn ticks_to_ms(t: u32) -> u32 {
    t * (1000 / HZ)
}

/// Periodic timer interrupt body: bump the clock, ask for a reschedule.
/// The board-specific ISR clears the hardware interrupt before calling this.
pub fn timer_int() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::sched::request_schedule();
}

#[cfg(test)]
pub(crate) fn set_ticks_for_test(t: u32) {
    TICKS.store(t, Ordering::Relaxed);
}

#[cfg(test)]
pub(crate) fn advance_ticks_for_test(n: u32) {
    TICKS.fetch_add(n, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ms_conversion() {
        assert_eq!(ms_to_ticks(1000), 100);
        assert_eq!(ms_to_ticks(10), 1);
        assert_eq!(ms_to_ticks(1), 1);
        assert_eq!(ms_to_ticks(0), 0);
        assert_eq!(ticks_to_ms(100), 1000);
    }
}
