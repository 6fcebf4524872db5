//! Per-tick telemetry.
//!
//! [`TickMonitor`] is the value handed to the [`TickObserver`](crate::collab::TickObserver)
//! once per tick. [`TickMetrics`] is the fuller breakdown returned by
//! [`TickDriver::tick`](crate::tick::TickDriver::tick).

use tessel_core::TickId;

use crate::dispatcher::ResizeReport;

/// The per-tick monitoring event.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TickMonitor {
    /// The completed tick.
    pub tick: TickId,
    /// Wall-clock duration of the tick, in milliseconds.
    pub tick_time_ms: f64,
    /// Time non-owner accesses spent waiting for handles during the
    /// tick, in milliseconds.
    pub acquisition_time_ms: f64,
}

/// Timing and counts collected during a single tick.
///
/// All durations are in microseconds.
#[derive(Clone, Debug, Default)]
pub struct TickMetrics {
    /// Wall-clock time for the entire tick.
    pub total_us: u64,
    /// Step 1: due scheduled tasks.
    pub scheduled_tasks_us: u64,
    /// Step 2: network ingestion.
    pub ingest_us: u64,
    /// Step 3, before the parallel phase: loads, spawns, removals.
    pub boundary_us: u64,
    /// Step 3: the parallel phase, up to the barrier.
    pub simulate_us: u64,
    /// Step 3, after the barrier: migrations and removal requests.
    pub outcomes_us: u64,
    /// Step 4: end-of-tick tasks.
    pub end_of_tick_us: u64,
    /// Step 5: outbound flush.
    pub flush_us: u64,
    /// Accumulated non-owner handle wait time.
    pub acquisition_wait_us: u64,
    /// Number of blocking handle accesses.
    pub acquisitions: u64,
    /// Regions updated.
    pub regions_updated: usize,
    /// Objects updated.
    pub objects_updated: usize,
    /// Faults reported to the sink, all phases.
    pub faults: usize,
    /// Objects that joined the world at the boundary.
    pub spawned: usize,
    /// Objects moved between regions at the boundary.
    pub migrations: usize,
    /// Objects removed at the boundary.
    pub removals: usize,
    /// Whether the tick took longer than its period.
    pub overrun: bool,
    /// Pool resize performed after the tick, if the size changed.
    pub resize: Option<ResizeReport>,
}

impl TickMetrics {
    /// The telemetry event for this tick.
    pub fn monitor(&self, tick: TickId) -> TickMonitor {
        TickMonitor {
            tick,
            tick_time_ms: self.total_us as f64 / 1000.0,
            acquisition_time_ms: self.acquisition_wait_us as f64 / 1000.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_metrics_are_zero() {
        let m = TickMetrics::default();
        assert_eq!(m.total_us, 0);
        assert_eq!(m.faults, 0);
        assert!(!m.overrun);
        assert!(m.resize.is_none());
    }

    #[test]
    fn monitor_converts_to_milliseconds() {
        let m = TickMetrics {
            total_us: 12_500,
            acquisition_wait_us: 250,
            ..TickMetrics::default()
        };
        let monitor = m.monitor(TickId(8));
        assert_eq!(monitor.tick, TickId(8));
        assert!((monitor.tick_time_ms - 12.5).abs() < f64::EPSILON);
        assert!((monitor.acquisition_time_ms - 0.25).abs() < f64::EPSILON);
    }
}
