//! Collaborators the tick driver sequences but does not implement.
//!
//! Each trait method returns recoverable faults as values and
//! unrecoverable ones as `Err(FatalError)`, so the recovery policy is
//! decided by type rather than by where a failure is caught.

use std::net::SocketAddr;

use tessel_core::{FatalError, SimulationFault, TickId};

use crate::metrics::TickMonitor;

/// A scheduler of deferred work, run at two fixed points of each tick.
pub trait TaskScheduler: Send {
    /// Run tasks due at `tick`. Step 1 of the tick.
    fn run_due_tasks(&mut self, tick: TickId) -> Result<Vec<SimulationFault>, FatalError>;

    /// Run end-of-tick tasks for `tick`. Step 4 of the tick.
    fn run_end_of_tick_tasks(&mut self, tick: TickId)
        -> Result<Vec<SimulationFault>, FatalError>;

    /// Stop accepting and running tasks.
    fn shutdown(&mut self);
}

/// Connection handling and batched output.
pub trait NetworkLayer: Send {
    /// Start listening on `addr`. Called once, before the first tick.
    fn bind(&mut self, addr: SocketAddr) -> Result<(), FatalError>;

    /// Process queued connections and input. Step 2 of the tick.
    fn ingest(&mut self, tick_start_ns: u64) -> Result<Vec<SimulationFault>, FatalError>;

    /// Send everything produced during the tick. Step 5; failure is fatal.
    fn flush_outbound(&mut self) -> Result<(), FatalError>;

    /// Stop ingesting and close connections.
    fn shutdown(&mut self);
}

/// Receives the per-tick telemetry event.
pub trait TickObserver: Send {
    /// Called once per completed tick, after the flush.
    fn on_tick(&mut self, monitor: &TickMonitor);
}

/// A network layer with no clients.
#[derive(Debug, Default)]
pub struct NullNetwork {
    bound: Option<SocketAddr>,
    flushes: u64,
}

impl NullNetwork {
    /// An unbound null network.
    pub fn new() -> Self {
        Self::default()
    }

    /// The address passed to `bind`, if any.
    pub fn bound(&self) -> Option<SocketAddr> {
        self.bound
    }

    /// Flushes performed.
    pub fn flushes(&self) -> u64 {
        self.flushes
    }
}

impl NetworkLayer for NullNetwork {
    fn bind(&mut self, addr: SocketAddr) -> Result<(), FatalError> {
        self.bound = Some(addr);
        Ok(())
    }

    fn ingest(&mut self, _tick_start_ns: u64) -> Result<Vec<SimulationFault>, FatalError> {
        Ok(Vec::new())
    }

    fn flush_outbound(&mut self) -> Result<(), FatalError> {
        self.flushes += 1;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.bound = None;
    }
}

/// Discards telemetry.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl TickObserver for NoopObserver {
    fn on_tick(&mut self, _monitor: &TickMonitor) {}
}

/// Logs each tick's telemetry at `trace` level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl TickObserver for TracingObserver {
    fn on_tick(&mut self, monitor: &TickMonitor) {
        tracing::trace!(
            tick = monitor.tick.0,
            tick_ms = monitor.tick_time_ms,
            acquisition_ms = monitor.acquisition_time_ms,
            "tick"
        );
    }
}
