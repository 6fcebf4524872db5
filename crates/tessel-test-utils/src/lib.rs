//! Test utilities and fake collaborators for Tessel development.
//!
//! Every collaborator the tick driver sequences has a recording fake
//! here: [`RecordingSink`], [`ScriptedScheduler`], [`FakeNetwork`] and
//! [`RecordingObserver`]. The fakes are cheap `Clone` handles over shared
//! state, so a test can box one into a server and keep another to inspect
//! afterwards. Passing the same [`CallLog`] to several fakes records the
//! order in which the driver called them.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fixtures;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use tessel_core::{FatalError, FaultContext, FaultPhase, SimulationFault, TickId};
use tessel_engine::{ExceptionSink, NetworkLayer, TaskScheduler, TickMonitor, TickObserver};

pub use fixtures::*;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Install a `tracing` subscriber honouring `RUST_LOG`, writing through
/// the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── CallLog ─────────────────────────────────────────────────────────

/// Shared, ordered record of collaborator calls.
#[derive(Clone, Debug, Default)]
pub struct CallLog(Arc<Mutex<Vec<&'static str>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: &'static str) {
        lock(&self.0).push(event);
    }

    pub fn events(&self) -> Vec<&'static str> {
        lock(&self.0).clone()
    }

    /// Events with the given prefix removed from consideration.
    pub fn without(&self, prefix: &str) -> Vec<&'static str> {
        lock(&self.0)
            .iter()
            .copied()
            .filter(|e| !e.starts_with(prefix))
            .collect()
    }
}

// ── RecordingSink ───────────────────────────────────────────────────

/// Stores every fault it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    faults: Mutex<Vec<(SimulationFault, FaultContext)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> Vec<(SimulationFault, FaultContext)> {
        lock(&self.faults).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.faults).len()
    }

    pub fn count_in(&self, phase: FaultPhase) -> usize {
        lock(&self.faults)
            .iter()
            .filter(|(_, ctx)| ctx.phase == phase)
            .count()
    }

    pub fn clear(&self) {
        lock(&self.faults).clear();
    }
}

impl ExceptionSink for RecordingSink {
    fn record(&self, fault: &SimulationFault, context: &FaultContext) {
        lock(&self.faults).push((fault.clone(), context.clone()));
    }
}

// ── ScriptedScheduler ───────────────────────────────────────────────

#[derive(Debug, Default)]
struct SchedulerState {
    failing: HashSet<u64>,
    fatal: HashSet<u64>,
    due_runs: Vec<TickId>,
    end_runs: Vec<TickId>,
    shut_down: bool,
}

/// A scheduler that fails or dies on chosen ticks.
#[derive(Clone, Debug, Default)]
pub struct ScriptedScheduler {
    state: Arc<Mutex<SchedulerState>>,
    log: Option<CallLog>,
}

impl ScriptedScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(mut self, log: &CallLog) -> Self {
        self.log = Some(log.clone());
        self
    }

    /// Report a recoverable task fault from step 1 of `tick`.
    pub fn fail_on(self, tick: u64) -> Self {
        lock(&self.state).failing.insert(tick);
        self
    }

    /// Return a fatal error from step 1 of `tick`.
    pub fn fatal_on(self, tick: u64) -> Self {
        lock(&self.state).fatal.insert(tick);
        self
    }

    pub fn due_runs(&self) -> Vec<TickId> {
        lock(&self.state).due_runs.clone()
    }

    pub fn end_runs(&self) -> Vec<TickId> {
        lock(&self.state).end_runs.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.state).shut_down
    }

    fn note(&self, event: &'static str) {
        if let Some(log) = &self.log {
            log.push(event);
        }
    }
}

impl TaskScheduler for ScriptedScheduler {
    fn run_due_tasks(&mut self, tick: TickId) -> Result<Vec<SimulationFault>, FatalError> {
        self.note("scheduler.due");
        let mut state = lock(&self.state);
        state.due_runs.push(tick);
        if state.fatal.contains(&tick.0) {
            return Err(FatalError::Scheduler {
                reason: format!("scripted fatal at tick {tick}"),
            });
        }
        if state.failing.contains(&tick.0) {
            return Ok(vec![SimulationFault::Task {
                reason: format!("scripted failure at tick {tick}"),
            }]);
        }
        Ok(Vec::new())
    }

    fn run_end_of_tick_tasks(
        &mut self,
        tick: TickId,
    ) -> Result<Vec<SimulationFault>, FatalError> {
        self.note("scheduler.end");
        lock(&self.state).end_runs.push(tick);
        Ok(Vec::new())
    }

    fn shutdown(&mut self) {
        self.note("scheduler.shutdown");
        lock(&self.state).shut_down = true;
    }
}

// ── FakeNetwork ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct NetworkState {
    bound: Option<SocketAddr>,
    fail_bind: bool,
    fail_flush_on: Option<u64>,
    ingest_faults: HashMap<u64, usize>,
    ingests: u64,
    flushes: u64,
    shut_down: bool,
}

/// A network layer with injectable failures.
///
/// Ingest and flush calls are counted from 1, which lines up with tick
/// numbers for a driver that has not skipped any tick.
#[derive(Clone, Debug, Default)]
pub struct FakeNetwork {
    state: Arc<Mutex<NetworkState>>,
    log: Option<CallLog>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(mut self, log: &CallLog) -> Self {
        self.log = Some(log.clone());
        self
    }

    pub fn failing_bind(self) -> Self {
        lock(&self.state).fail_bind = true;
        self
    }

    /// Fail the `n`th flush.
    pub fn failing_flush_on(self, n: u64) -> Self {
        lock(&self.state).fail_flush_on = Some(n);
        self
    }

    /// Report `count` ingest faults from the `n`th ingest.
    pub fn ingest_faults_on(self, n: u64, count: usize) -> Self {
        lock(&self.state).ingest_faults.insert(n, count);
        self
    }

    pub fn bound(&self) -> Option<SocketAddr> {
        lock(&self.state).bound
    }

    pub fn ingests(&self) -> u64 {
        lock(&self.state).ingests
    }

    pub fn flushes(&self) -> u64 {
        lock(&self.state).flushes
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.state).shut_down
    }

    fn note(&self, event: &'static str) {
        if let Some(log) = &self.log {
            log.push(event);
        }
    }
}

impl NetworkLayer for FakeNetwork {
    fn bind(&mut self, addr: SocketAddr) -> Result<(), FatalError> {
        self.note("network.bind");
        let mut state = lock(&self.state);
        if state.fail_bind {
            return Err(FatalError::Bind {
                addr: addr.to_string(),
                reason: "address in use".into(),
            });
        }
        state.bound = Some(addr);
        Ok(())
    }

    fn ingest(&mut self, _tick_start_ns: u64) -> Result<Vec<SimulationFault>, FatalError> {
        self.note("network.ingest");
        let mut state = lock(&self.state);
        state.ingests += 1;
        let count = state.ingest_faults.get(&state.ingests).copied().unwrap_or(0);
        Ok((0..count)
            .map(|i| SimulationFault::Ingest {
                reason: format!("malformed packet {i}"),
            })
            .collect())
    }

    fn flush_outbound(&mut self) -> Result<(), FatalError> {
        self.note("network.flush");
        let mut state = lock(&self.state);
        state.flushes += 1;
        if state.fail_flush_on == Some(state.flushes) {
            return Err(FatalError::Flush {
                reason: "connection reset".into(),
            });
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.note("network.shutdown");
        let mut state = lock(&self.state);
        state.shut_down = true;
        state.bound = None;
    }
}

// ── RecordingObserver ───────────────────────────────────────────────

/// Keeps every telemetry event.
#[derive(Clone, Debug, Default)]
pub struct RecordingObserver {
    monitors: Arc<Mutex<Vec<TickMonitor>>>,
    log: Option<CallLog>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(mut self, log: &CallLog) -> Self {
        self.log = Some(log.clone());
        self
    }

    pub fn monitors(&self) -> Vec<TickMonitor> {
        lock(&self.monitors).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.monitors).len()
    }
}

impl TickObserver for RecordingObserver {
    fn on_tick(&mut self, monitor: &TickMonitor) {
        if let Some(log) = &self.log {
            log.push("observer.tick");
        }
        lock(&self.monitors).push(*monitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fakes_share_state_across_clones() {
        let log = CallLog::new();
        let net = FakeNetwork::new().with_log(&log).failing_flush_on(2);
        let mut boxed: Box<dyn NetworkLayer> = Box::new(net.clone());
        boxed.flush_outbound().unwrap();
        assert!(boxed.flush_outbound().is_err());
        assert_eq!(net.flushes(), 2);
        assert_eq!(log.events(), vec!["network.flush", "network.flush"]);
    }

    #[test]
    fn scripted_scheduler_follows_its_script() {
        let mut s = ScriptedScheduler::new().fail_on(2).fatal_on(3);
        assert!(s.run_due_tasks(TickId(1)).unwrap().is_empty());
        assert_eq!(s.run_due_tasks(TickId(2)).unwrap().len(), 1);
        assert!(s.run_due_tasks(TickId(3)).is_err());
        assert_eq!(s.due_runs().len(), 3);
    }
}
