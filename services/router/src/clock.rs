//! Coarse monotonic clock used for timeouts and pool ages.
//!
//! Time is measured in ticks of 100 ms. Workers hold an `Arc<dyn Clock>` so
//! tests can drive time explicitly with `ManualClock`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A point in time, in ticks since the clock started.
pub type Tick = u64;

/// Ticks per second.
pub const TICKS_PER_SECOND: u64 = 10;

/// Length of one tick.
pub const TICK: Duration = Duration::from_millis(1000 / TICKS_PER_SECOND);

/// Convert a duration to whole ticks.
pub fn ticks(duration: Duration) -> Tick {
    (duration.as_millis() / TICK.as_millis()) as Tick
}

/// Source of the current tick.
pub trait Clock: Send + Sync {
    fn now(&self) -> Tick;
}

/// Wall-clock ticks since construction.
#[derive(Debug)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Tick {
        ticks(self.start.elapsed())
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.now.fetch_add(ticks(duration), Ordering::SeqCst);
    }

    pub fn advance_ticks(&self, n: Tick) {
        self.now.fetch_add(n, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Tick {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_conversion() {
        assert_eq!(ticks(Duration::from_secs(1)), TICKS_PER_SECOND);
        assert_eq!(ticks(Duration::from_millis(250)), 2);
        assert_eq!(ticks(Duration::ZERO), 0);
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), 0);

        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now(), 20);

        clock.advance_ticks(3);
        assert_eq!(clock.now(), 23);
    }
}
