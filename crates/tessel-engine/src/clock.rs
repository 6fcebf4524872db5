//! Monotonic time source and the tick clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use tessel_core::TickId;

/// Returns monotonic nanoseconds since an arbitrary process-local epoch.
///
/// Uses `OnceLock<Instant>` to lazily initialise a baseline. NOT wall-clock
/// time, only for relative duration comparisons. Every timestamp in the
/// engine comes from here so that values taken on different threads are
/// comparable.
pub fn monotonic_nanos() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    Instant::now().duration_since(*epoch).as_nanos() as u64
}

/// The current tick number and the instant it started.
///
/// Shared read-only with every component; only the tick driver
/// advances it.
#[derive(Debug, Default)]
pub struct TickClock {
    tick: AtomicU64,
    start_ns: AtomicU64,
}

// Compile-time assertion: TickClock must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<TickClock>();
};

impl TickClock {
    /// A clock that has not ticked yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently started tick, `TickId(0)` before the first one.
    pub fn tick(&self) -> TickId {
        TickId(self.tick.load(Ordering::Acquire))
    }

    /// [`monotonic_nanos`] value at the start of the current tick.
    pub fn tick_start_ns(&self) -> u64 {
        self.start_ns.load(Ordering::Acquire)
    }

    /// Start the next tick. Returns its id and start timestamp.
    pub(crate) fn begin_tick(&self) -> (TickId, u64) {
        let now = monotonic_nanos();
        self.start_ns.store(now, Ordering::Release);
        let tick = self.tick.fetch_add(1, Ordering::AcqRel) + 1;
        (TickId(tick), now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_never_goes_backwards() {
        let a = monotonic_nanos();
        let b = monotonic_nanos();
        assert!(b >= a);
    }

    #[test]
    fn begin_tick_advances() {
        let clock = TickClock::new();
        assert_eq!(clock.tick(), TickId(0));
        let (t1, s1) = clock.begin_tick();
        let (t2, s2) = clock.begin_tick();
        assert_eq!(t1, TickId(1));
        assert_eq!(t2, TickId(2));
        assert!(s2 >= s1);
        assert_eq!(clock.tick(), TickId(2));
        assert_eq!(clock.tick_start_ns(), s2);
    }
}
