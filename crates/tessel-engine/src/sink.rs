//! Where recoverable simulation faults go.

use std::sync::atomic::{AtomicU64, Ordering};

use tessel_core::{FaultContext, SimulationFault};

/// Receives every caught per-region, per-object and per-phase fault.
///
/// Called from worker threads concurrently; implementations must not
/// panic and should return quickly.
pub trait ExceptionSink: Send + Sync {
    /// Record one fault.
    fn record(&self, fault: &SimulationFault, context: &FaultContext);
}

/// Logs each fault at `error` level and counts them.
#[derive(Debug, Default)]
pub struct LoggingSink {
    recorded: AtomicU64,
}

impl LoggingSink {
    /// A sink with a zeroed counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Faults recorded so far.
    pub fn recorded(&self) -> u64 {
        self.recorded.load(Ordering::Relaxed)
    }
}

impl ExceptionSink for LoggingSink {
    fn record(&self, fault: &SimulationFault, context: &FaultContext) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            tick = context.tick.0,
            phase = %context.phase,
            partition = ?context.partition,
            region = ?context.region,
            object = ?context.object,
            "{fault}"
        );
    }
}
