//! Monotonic time sources.
//!
//! Deadlines in a quorum wait are computed against a [`Clock`] rather than
//! `Instant::now()` directly, so a stalled process can be simulated by a
//! clock that jumps forward.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A monotonic time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The process monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Monotonic clock with an adjustable forward offset.
///
/// Reads real monotonic time plus every offset added through
/// [`OffsetClock::advance`]. Advancing the clock while a thread is blocked
/// looks, to that thread, exactly like the process having been suspended.
#[derive(Debug, Default)]
pub struct OffsetClock {
    offset: Mutex<Duration>,
}

impl OffsetClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Returns the total offset added so far.
    pub fn offset(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Clock for OffsetClock {
    fn now(&self) -> Instant {
        Instant::now() + *self.offset.lock()
    }
}

/// Restartable stopwatch over a [`Clock`].
pub struct Stopwatch<'a> {
    clock: &'a dyn Clock,
    started: Instant,
}

impl<'a> Stopwatch<'a> {
    pub fn start(clock: &'a dyn Clock) -> Self {
        Self {
            clock,
            started: clock.now(),
        }
    }

    pub fn restart(&mut self) {
        self.started = self.clock.now();
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_clock_advances() {
        let clock = OffsetClock::new();
        let before = clock.now();
        clock.advance(Duration::from_secs(25));
        let after = clock.now();

        assert!(after.duration_since(before) >= Duration::from_secs(25));
        assert_eq!(clock.offset(), Duration::from_secs(25));
    }

    #[test]
    fn test_stopwatch_sees_jump() {
        let clock = OffsetClock::new();
        let mut watch = Stopwatch::start(clock.as_ref());
        clock.advance(Duration::from_secs(3));
        assert!(watch.elapsed() >= Duration::from_secs(3));

        watch.restart();
        assert!(watch.elapsed() < Duration::from_secs(1));
    }
}
