//! The tick driver: one strictly ordered simulation step per period.
//!
//! Each tick runs six steps on the driver thread:
//!
//! 1. Due scheduled tasks.
//! 2. Network ingestion.
//! 3. Boundary synchronization, then [`Dispatcher::simulate`] (the
//!    parallel, barrier-synchronized phase), then migrations and
//!    removal requests.
//! 4. End-of-tick scheduled tasks.
//! 5. Outbound flush.
//! 6. Telemetry, then [`Dispatcher::resize`] with the time left in the
//!    period.
//!
//! Faults from steps 1 to 4 are reported to the [`ExceptionSink`] and the
//! tick carries on. A fatal error from any step (a flush failure, an
//! unrecoverable scheduler fault, a lost worker) moves the driver to
//! [`DriverState::Stopped`].
//!
//! A collaborator that panics in steps 1, 2 or 4 is reported as a
//! [`SimulationFault::Panicked`]; a panicking flush is a fatal
//! [`FatalError::Flush`].

use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tessel_core::{FatalError, FaultContext, FaultPhase, SimulationFault, TickId};

use crate::clock::TickClock;
use crate::collab::{NetworkLayer, TaskScheduler, TickObserver};
use crate::context::TickContext;
use crate::dispatcher::{Dispatcher, PoolShutdownReport};
use crate::metrics::{TickMetrics, TickMonitor};
use crate::partition::guarded;
use crate::sink::ExceptionSink;
use crate::world::World;

/// Where the driver is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    /// Between ticks.
    Idle,
    /// Inside [`TickDriver::tick`].
    Running,
    /// Terminal. Reached on a fatal error or on shutdown.
    Stopped,
}

/// Why a tick did not complete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TickError {
    /// The driver was already stopped.
    Stopped,
    /// The tick hit a fatal error; the driver is now stopped.
    Fatal(FatalError),
}

impl fmt::Display for TickError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "tick driver is stopped"),
            Self::Fatal(e) => write!(f, "fatal tick error: {e}"),
        }
    }
}

impl Error for TickError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Fatal(e) => Some(e),
            Self::Stopped => None,
        }
    }
}

/// Result of one completed tick.
#[derive(Clone, Debug)]
pub struct TickReport {
    /// The tick that ran.
    pub tick: TickId,
    /// The telemetry event sent to the observer.
    pub monitor: TickMonitor,
    /// Detailed timing and counts.
    pub metrics: TickMetrics,
}

/// Everything a [`TickDriver`] sequences.
pub struct TickParts {
    /// The world registry.
    pub world: Arc<World>,
    /// Worker pool and partitions.
    pub dispatcher: Dispatcher,
    /// Steps 1 and 4.
    pub scheduler: Box<dyn TaskScheduler>,
    /// Steps 2 and 5.
    pub network: Box<dyn NetworkLayer>,
    /// Receives step 6 telemetry.
    pub observer: Box<dyn TickObserver>,
    /// Receives every recoverable fault.
    pub sink: Arc<dyn ExceptionSink>,
    /// Shared tick counter.
    pub clock: Arc<TickClock>,
    /// Length of one tick.
    pub period: Duration,
    /// Late ticks that may run back-to-back before the schedule
    /// re-anchors.
    pub max_catch_up: u32,
}

/// The per-tick orchestrator. Owned by the tick thread.
pub struct TickDriver {
    world: Arc<World>,
    dispatcher: Dispatcher,
    scheduler: Box<dyn TaskScheduler>,
    network: Box<dyn NetworkLayer>,
    observer: Box<dyn TickObserver>,
    sink: Arc<dyn ExceptionSink>,
    clock: Arc<TickClock>,
    period: Duration,
    max_catch_up: u32,
    target_threads: Arc<AtomicUsize>,
    state: DriverState,
    components_down: bool,
}

// Compile-time assertion: the driver moves onto its own thread.
const _: fn() = || {
    fn assert<T: Send>() {}
    assert::<TickDriver>();
};

fn micros(since: Instant) -> u64 {
    since.elapsed().as_micros() as u64
}

impl TickDriver {
    /// Build an idle driver.
    pub fn new(parts: TickParts) -> Self {
        let target = parts.dispatcher.thread_count();
        Self {
            world: parts.world,
            dispatcher: parts.dispatcher,
            scheduler: parts.scheduler,
            network: parts.network,
            observer: parts.observer,
            sink: parts.sink,
            clock: parts.clock,
            period: parts.period,
            max_catch_up: parts.max_catch_up,
            target_threads: Arc::new(AtomicUsize::new(target)),
            state: DriverState::Idle,
            components_down: false,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DriverState {
        self.state
    }

    /// The world being simulated.
    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    /// The dispatcher.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The shared tick clock.
    pub fn clock(&self) -> &Arc<TickClock> {
        &self.clock
    }

    /// Length of one tick.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Handle for requesting a pool size; applied at the end of a tick.
    pub fn target_threads(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.target_threads)
    }

    /// Bind the network layer. Called once, before the first tick.
    pub fn bind(&mut self, addr: std::net::SocketAddr) -> Result<(), FatalError> {
        self.network.bind(addr)
    }

    /// Run one tick.
    pub fn tick(&mut self) -> Result<TickReport, TickError> {
        if self.state == DriverState::Stopped {
            return Err(TickError::Stopped);
        }
        self.state = DriverState::Running;
        match self.run_tick() {
            Ok(report) => {
                self.state = DriverState::Idle;
                Ok(report)
            }
            Err(e) => {
                self.state = DriverState::Stopped;
                tracing::error!(error = %e, tick = self.clock.tick().0, "fatal error, tick loop stopping");
                Err(TickError::Fatal(e))
            }
        }
    }

    fn run_tick(&mut self) -> Result<TickReport, FatalError> {
        let started = Instant::now();
        let (tick, tick_start_ns) = self.clock.begin_tick();
        let mut m = TickMetrics::default();

        // 1. Due scheduled tasks.
        let t = Instant::now();
        let faults = collaborator_step(|| self.scheduler.run_due_tasks(tick))?;
        m.faults += self.report_faults(tick, FaultPhase::ScheduledTasks, faults);
        m.scheduled_tasks_us = micros(t);

        // 2. Network ingestion.
        let t = Instant::now();
        let faults = collaborator_step(|| self.network.ingest(tick_start_ns))?;
        m.faults += self.report_faults(tick, FaultPhase::Ingest, faults);
        m.ingest_us = micros(t);

        // 3. Boundary, parallel simulation, boundary.
        let t = Instant::now();
        let boundary = self.dispatcher.synchronize(&self.world, tick);
        m.spawned = boundary.spawned;
        m.removals = boundary.removed;
        m.faults += boundary.faults;
        m.boundary_us = micros(t);

        let t = Instant::now();
        let budget = self.period.saturating_sub(started.elapsed());
        let ctx = TickContext::new(tick, tick_start_ns).with_budget(budget.as_nanos() as u64);
        let sim = self.dispatcher.simulate(ctx)?;
        m.simulate_us = micros(t);
        m.regions_updated = sim.regions_updated();
        m.objects_updated = sim.objects_updated();
        m.faults += sim.faults();

        let t = Instant::now();
        let outcome = self.dispatcher.apply_outcomes(&self.world, &sim, tick);
        m.migrations = outcome.migrated;
        m.removals += outcome.removed;
        m.faults += outcome.faults;
        m.outcomes_us = micros(t);

        // 4. End-of-tick tasks.
        let t = Instant::now();
        let faults = collaborator_step(|| self.scheduler.run_end_of_tick_tasks(tick))?;
        m.faults += self.report_faults(tick, FaultPhase::EndOfTickTasks, faults);
        m.end_of_tick_us = micros(t);

        // 5. Flush.
        let t = Instant::now();
        guarded(|| self.network.flush_outbound()).map_err(|fault| FatalError::Flush {
            reason: fault.to_string(),
        })??;
        m.flush_us = micros(t);

        // 6. Telemetry, then resize with whatever is left of the period.
        let sample = self.world.acquire_stats().reset();
        m.acquisition_wait_us = sample.wait_ns / 1000;
        m.acquisitions = sample.acquisitions;
        let elapsed = started.elapsed();
        m.total_us = elapsed.as_micros() as u64;
        m.overrun = elapsed > self.period;
        let monitor = m.monitor(tick);
        self.observer.on_tick(&monitor);

        let remaining = self.period.as_nanos() as i64 - started.elapsed().as_nanos() as i64;
        let target = self.target_threads.load(Ordering::Relaxed);
        let resize = self.dispatcher.resize(target, remaining);
        if resize.changed() {
            m.resize = Some(resize);
        }

        tracing::trace!(
            tick = tick.0,
            total_us = m.total_us,
            simulate_us = m.simulate_us,
            objects = m.objects_updated,
            "tick complete"
        );
        Ok(TickReport {
            tick,
            monitor,
            metrics: m,
        })
    }

    fn report_faults(&self, tick: TickId, phase: FaultPhase, faults: Vec<SimulationFault>) -> usize {
        let ctx = FaultContext::new(tick, phase);
        for fault in &faults {
            self.sink.record(fault, &ctx);
        }
        faults.len()
    }

    /// Tick at the configured rate until `shutdown` is set.
    ///
    /// Returns the fatal error that stopped the loop, if any. Sleeps with
    /// `park_timeout`, so unparking the thread after setting `shutdown`
    /// makes it exit promptly.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Option<FatalError> {
        let mut next = Instant::now();
        let mut caught_up = 0u32;
        while !shutdown.load(Ordering::Acquire) {
            match self.tick() {
                Ok(report) if report.metrics.overrun => {
                    tracing::warn!(
                        tick = report.tick.0,
                        tick_ms = report.monitor.tick_time_ms,
                        period_ms = self.period.as_secs_f64() * 1000.0,
                        "tick overran its period"
                    );
                }
                Ok(_) => {}
                Err(TickError::Fatal(e)) => return Some(e),
                Err(TickError::Stopped) => return None,
            }

            next += self.period;
            let now = Instant::now();
            if now >= next {
                if caught_up < self.max_catch_up {
                    caught_up += 1;
                } else {
                    // Too far behind: skip the missed ticks.
                    caught_up = 0;
                    next = now;
                }
                continue;
            }
            caught_up = 0;
            Self::sleep_until(next, shutdown);
        }
        None
    }

    fn sleep_until(deadline: Instant, shutdown: &AtomicBool) {
        loop {
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::park_timeout(deadline - now);
        }
    }

    /// Stop the scheduler, the network, the worker pool, then release
    /// every partition, in that order. Idempotent.
    pub fn shutdown_components(&mut self) -> PoolShutdownReport {
        self.state = DriverState::Stopped;
        if self.components_down {
            return PoolShutdownReport::default();
        }
        self.components_down = true;
        tracing::info!("shutting down all thread pools");
        if let Err(fault) = guarded(|| self.scheduler.shutdown()) {
            tracing::warn!(%fault, "scheduler shutdown failed");
        }
        if let Err(fault) = guarded(|| self.network.shutdown()) {
            tracing::warn!(%fault, "network shutdown failed");
        }
        let mut report = self.dispatcher.stop_workers();
        report.regions_released = self.dispatcher.release_partitions();
        report
    }
}

/// Run a collaborator step. A panic becomes one recoverable fault.
fn collaborator_step(
    step: impl FnOnce() -> Result<Vec<SimulationFault>, FatalError>,
) -> Result<Vec<SimulationFault>, FatalError> {
    match guarded(step) {
        Ok(result) => result,
        Err(panicked) => Ok(vec![panicked]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RoundRobin;
    use crate::sink::LoggingSink;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    struct Steps {
        log: Log,
        fail_flush: bool,
        fault_first: bool,
    }

    impl TaskScheduler for Steps {
        fn run_due_tasks(&mut self, _tick: TickId) -> Result<Vec<SimulationFault>, FatalError> {
            self.log.lock().unwrap().push("due");
            if self.fault_first {
                return Ok(vec![SimulationFault::Task {
                    reason: "flaky".into(),
                }]);
            }
            Ok(Vec::new())
        }

        fn run_end_of_tick_tasks(
            &mut self,
            _tick: TickId,
        ) -> Result<Vec<SimulationFault>, FatalError> {
            self.log.lock().unwrap().push("end");
            Ok(Vec::new())
        }

        fn shutdown(&mut self) {
            self.log.lock().unwrap().push("scheduler-stop");
        }
    }

    impl NetworkLayer for Steps {
        fn bind(&mut self, _addr: std::net::SocketAddr) -> Result<(), FatalError> {
            Ok(())
        }

        fn ingest(&mut self, _tick_start_ns: u64) -> Result<Vec<SimulationFault>, FatalError> {
            self.log.lock().unwrap().push("ingest");
            Ok(Vec::new())
        }

        fn flush_outbound(&mut self) -> Result<(), FatalError> {
            self.log.lock().unwrap().push("flush");
            if self.fail_flush {
                return Err(FatalError::Flush {
                    reason: "peer reset".into(),
                });
            }
            Ok(())
        }

        fn shutdown(&mut self) {
            self.log.lock().unwrap().push("network-stop");
        }
    }

    struct Observe(Log);

    impl TickObserver for Observe {
        fn on_tick(&mut self, _monitor: &TickMonitor) {
            self.0.lock().unwrap().push("observe");
        }
    }

    fn driver(log: &Log, fail_flush: bool, sink: Arc<LoggingSink>) -> TickDriver {
        let dispatcher = Dispatcher::new(2, Box::new(RoundRobin::new()), sink.clone()).unwrap();
        TickDriver::new(TickParts {
            world: Arc::new(World::new()),
            dispatcher,
            scheduler: Box::new(Steps {
                log: Arc::clone(log),
                fail_flush: false,
                fault_first: true,
            }),
            network: Box::new(Steps {
                log: Arc::clone(log),
                fail_flush,
                fault_first: false,
            }),
            observer: Box::new(Observe(Arc::clone(log))),
            sink,
            clock: Arc::new(TickClock::new()),
            period: Duration::from_millis(50),
            max_catch_up: 0,
        })
    }

    #[test]
    fn steps_run_in_order() {
        let log = Log::default();
        let sink = Arc::new(LoggingSink::new());
        let mut d = driver(&log, false, Arc::clone(&sink));
        let report = d.tick().unwrap();
        assert_eq!(report.tick, TickId(1));
        assert_eq!(d.state(), DriverState::Idle);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["due", "ingest", "end", "flush", "observe"]
        );
        // The scheduled-task fault was reported, not fatal.
        assert_eq!(report.metrics.faults, 1);
        assert_eq!(sink.recorded(), 1);
    }

    #[test]
    fn flush_failure_is_fatal_and_terminal() {
        let log = Log::default();
        let mut d = driver(&log, true, Arc::new(LoggingSink::new()));
        let err = d.tick().unwrap_err();
        assert!(matches!(err, TickError::Fatal(FatalError::Flush { .. })));
        assert_eq!(d.state(), DriverState::Stopped);
        assert_eq!(d.tick().unwrap_err(), TickError::Stopped);
        assert!(!log.lock().unwrap().contains(&"observe"));
    }

    #[test]
    fn shutdown_order_and_idempotence() {
        let log = Log::default();
        let mut d = driver(&log, false, Arc::new(LoggingSink::new()));
        let report = d.shutdown_components();
        assert_eq!(report.workers_joined, 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["scheduler-stop", "network-stop"]
        );
        assert_eq!(d.shutdown_components(), PoolShutdownReport::default());
        assert_eq!(d.state(), DriverState::Stopped);
    }

    #[test]
    fn target_threads_resizes_after_tick() {
        let log = Log::default();
        let mut d = driver(&log, false, Arc::new(LoggingSink::new()));
        d.target_threads().store(3, Ordering::Relaxed);
        let report = d.tick().unwrap();
        // A generous period leaves budget for the resize.
        let resize = report.metrics.resize.expect("pool resized");
        assert_eq!((resize.previous, resize.current), (2, 3));
        assert_eq!(d.dispatcher().thread_count(), 3);
    }

    /// Panics in every collaborator step it is asked to.
    struct Panicky {
        flush: bool,
    }

    impl TaskScheduler for Panicky {
        fn run_due_tasks(&mut self, _tick: TickId) -> Result<Vec<SimulationFault>, FatalError> {
            panic!("due task blew up")
        }

        fn run_end_of_tick_tasks(
            &mut self,
            _tick: TickId,
        ) -> Result<Vec<SimulationFault>, FatalError> {
            std::panic::panic_any(String::from("end task blew up"))
        }

        fn shutdown(&mut self) {}
    }

    impl NetworkLayer for Panicky {
        fn bind(&mut self, _addr: std::net::SocketAddr) -> Result<(), FatalError> {
            Ok(())
        }

        fn ingest(&mut self, _tick_start_ns: u64) -> Result<Vec<SimulationFault>, FatalError> {
            panic!("bad packet")
        }

        fn flush_outbound(&mut self) -> Result<(), FatalError> {
            if self.flush {
                panic!("socket gone");
            }
            Ok(())
        }

        fn shutdown(&mut self) {}
    }

    fn panicky_driver(flush: bool, sink: Arc<LoggingSink>) -> TickDriver {
        let dispatcher = Dispatcher::new(1, Box::new(RoundRobin::new()), sink.clone()).unwrap();
        TickDriver::new(TickParts {
            world: Arc::new(World::new()),
            dispatcher,
            scheduler: Box::new(Panicky { flush: false }),
            network: Box::new(Panicky { flush }),
            observer: Box::new(crate::collab::NoopObserver),
            sink,
            clock: Arc::new(TickClock::new()),
            period: Duration::from_millis(50),
            max_catch_up: 0,
        })
    }

    #[test]
    fn collaborator_panics_are_reported_and_the_tick_completes() {
        let sink = Arc::new(LoggingSink::new());
        let mut d = panicky_driver(false, Arc::clone(&sink));
        let report = d.tick().unwrap();
        assert_eq!(report.metrics.faults, 3);
        assert_eq!(sink.recorded(), 3);
        assert_eq!(d.state(), DriverState::Idle);
        // And again on the next tick.
        assert_eq!(d.tick().unwrap().metrics.faults, 3);
    }

    #[test]
    fn flush_panic_is_fatal() {
        let mut d = panicky_driver(true, Arc::new(LoggingSink::new()));
        match d.tick().unwrap_err() {
            TickError::Fatal(FatalError::Flush { reason }) => {
                assert!(reason.contains("socket gone"), "{reason}");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(d.state(), DriverState::Stopped);
    }

    #[test]
    fn run_exits_when_flag_is_set() {
        let log = Log::default();
        let mut d = driver(&log, false, Arc::new(LoggingSink::new()));
        let flag = AtomicBool::new(true);
        assert_eq!(d.run(&flag), None);
        assert_eq!(d.clock().tick(), TickId(0));
    }
}
