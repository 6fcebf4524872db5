//! The worker pool and the partition set.
//!
//! Partition `i` is always simulated by worker `i`, so the partition
//! count tracks the thread count. Each worker owns a job channel; a tick
//! sends one job per worker and then waits for every reply, so
//! [`Dispatcher::simulate`] is a full barrier. Membership changes
//! (loads, spawns, removals, migrations, rebalancing) are applied only
//! between ticks, from the driver thread, while no segment is running.
//! `simulate`, `resize` and the boundary calls all take `&mut self`, so
//! the borrow checker rules out overlapping them.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use indexmap::IndexMap;
use tessel_core::{
    FatalError, FaultContext, FaultPhase, ObjectId, PartitionId, RegionCoord, SimulationFault,
    TickId, WorkerId,
};

use crate::context::TickContext;
use crate::handle::{PartitionGate, SafeHandle, WorkerToken};
use crate::object::ObjectHandle;
use crate::partition::{panic_message, Partition, SegmentReport};
use crate::policy::AssignmentPolicy;
use crate::region::{Region, RegionHandle};
use crate::sink::ExceptionSink;
use crate::world::World;

/// Upper bound on pool size.
pub const MAX_WORKERS: usize = 64;

enum WorkerJob {
    Segment {
        partition: Arc<Partition>,
        tick: TickContext,
        reply: Sender<SegmentReport>,
    },
    Exit,
}

struct Worker {
    id: WorkerId,
    jobs: Sender<WorkerJob>,
    thread: JoinHandle<()>,
}

fn worker_loop(jobs: Receiver<WorkerJob>, sink: Arc<dyn ExceptionSink>) {
    let token = WorkerToken::allocate();
    token.install();
    while let Ok(job) = jobs.recv() {
        match job {
            WorkerJob::Segment {
                partition,
                tick,
                reply,
            } => {
                let report = panic::catch_unwind(AssertUnwindSafe(|| {
                    partition.run_segment(token, &tick, sink.as_ref())
                }))
                .unwrap_or_else(|payload| {
                    let fault = SimulationFault::Panicked {
                        message: panic_message(payload.as_ref()),
                    };
                    let ctx = FaultContext::new(tick.tick, FaultPhase::Simulation)
                        .with_partition(partition.id());
                    sink.record(&fault, &ctx);
                    let mut report = SegmentReport::new(partition.id());
                    report.faults = 1;
                    report
                });
                // The driver only drops the reply side on a lost worker,
                // which is already fatal.
                let _ = reply.send(report);
            }
            WorkerJob::Exit => break,
        }
    }
}

/// Result of one parallel simulation round.
#[derive(Clone, Debug)]
pub struct SimulationReport {
    /// The tick simulated.
    pub tick: TickId,
    /// One report per partition, ordered by partition id.
    pub segments: Vec<SegmentReport>,
    /// Driver-side wall time from first send to last reply.
    pub elapsed: Duration,
}

impl SimulationReport {
    /// Regions updated across all partitions.
    pub fn regions_updated(&self) -> usize {
        self.segments.iter().map(|s| s.regions_updated).sum()
    }

    /// Objects updated across all partitions.
    pub fn objects_updated(&self) -> usize {
        self.segments.iter().map(|s| s.objects_updated).sum()
    }

    /// Faults recorded across all partitions.
    pub fn faults(&self) -> usize {
        self.segments.iter().map(|s| s.faults).sum()
    }

    /// Migrations to apply at the boundary.
    pub fn migrations(&self) -> usize {
        self.segments.iter().map(|s| s.migrations.len()).sum()
    }

    /// Removal requests to apply at the boundary.
    pub fn removals(&self) -> usize {
        self.segments.iter().map(|s| s.removals.len()).sum()
    }
}

/// What a boundary pass changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BoundaryReport {
    /// Regions loaded (explicitly or for an arriving object).
    pub regions_loaded: usize,
    /// Objects that joined their first region.
    pub spawned: usize,
    /// Objects moved between regions.
    pub migrated: usize,
    /// Objects removed and invalidated.
    pub removed: usize,
    /// Faults recorded to the sink.
    pub faults: usize,
}

/// Outcome of [`Dispatcher::resize`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResizeReport {
    /// Thread count before.
    pub previous: usize,
    /// Thread count after.
    pub current: usize,
    /// Regions whose partition changed.
    pub regions_moved: usize,
    /// Whether the reconfiguration finished inside its budget.
    pub within_budget: bool,
    /// Time spent.
    pub elapsed: Duration,
}

impl ResizeReport {
    fn unchanged(threads: usize) -> Self {
        Self {
            previous: threads,
            current: threads,
            regions_moved: 0,
            within_budget: true,
            elapsed: Duration::ZERO,
        }
    }

    /// Whether the pool size changed.
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Outcome of stopping the pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolShutdownReport {
    /// Workers joined cleanly.
    pub workers_joined: usize,
    /// Workers that had panicked.
    pub workers_panicked: usize,
    /// Regions released from their partitions.
    pub regions_released: usize,
}

/// Owns the worker pool and the partitions.
pub struct Dispatcher {
    policy: Box<dyn AssignmentPolicy>,
    sink: Arc<dyn ExceptionSink>,
    partitions: Vec<Arc<Partition>>,
    workers: Vec<Worker>,
    assignments: IndexMap<RegionCoord, PartitionId>,
    workers_stopped: bool,
}

impl Dispatcher {
    /// Spawn `thread_count` workers (clamped to `1..=MAX_WORKERS`) with
    /// one empty partition each.
    pub fn new(
        thread_count: usize,
        policy: Box<dyn AssignmentPolicy>,
        sink: Arc<dyn ExceptionSink>,
    ) -> Result<Self, FatalError> {
        let mut dispatcher = Self {
            policy,
            sink,
            partitions: Vec::new(),
            workers: Vec::new(),
            assignments: IndexMap::new(),
            workers_stopped: false,
        };
        for _ in 0..thread_count.clamp(1, MAX_WORKERS) {
            dispatcher.grow()?;
        }
        tracing::info!(
            threads = dispatcher.thread_count(),
            policy = dispatcher.policy.name(),
            "dispatcher started"
        );
        Ok(dispatcher)
    }

    /// Live worker threads.
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Partitions; equal to [`thread_count`](Self::thread_count) while running.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// The partitions, indexed by id.
    pub fn partitions(&self) -> &[Arc<Partition>] {
        &self.partitions
    }

    /// The assignment policy.
    pub fn policy(&self) -> &dyn AssignmentPolicy {
        self.policy.as_ref()
    }

    /// Partition owning `region`, if it has been observed.
    pub fn partition_of(&self, region: RegionCoord) -> Option<PartitionId> {
        self.assignments.get(&region).copied()
    }

    /// Every observed region and its partition, in observation order.
    pub fn assignments(&self) -> &IndexMap<RegionCoord, PartitionId> {
        &self.assignments
    }

    /// Partition for `region`, asking the policy on first sight.
    ///
    /// Stable: repeated calls return the same partition until a resize.
    pub fn assign(&mut self, region: RegionCoord) -> PartitionId {
        if let Some(p) = self.assignments.get(&region) {
            return *p;
        }
        let p = self.policy.assign(region, self.partitions.len().max(1));
        self.assignments.insert(region, p);
        p
    }

    fn grow(&mut self) -> Result<(), FatalError> {
        let index = self.workers.len();
        let (tx, rx) = crossbeam_channel::unbounded();
        let sink = Arc::clone(&self.sink);
        let thread = thread::Builder::new()
            .name(format!("tessel-worker-{index}"))
            .spawn(move || worker_loop(rx, sink))
            .map_err(|e| FatalError::ThreadSpawn {
                reason: format!("tessel-worker-{index}: {e}"),
            })?;
        self.workers.push(Worker {
            id: WorkerId(index as u32),
            jobs: tx,
            thread,
        });
        self.partitions
            .push(Arc::new(Partition::new(PartitionId(index as u32))));
        Ok(())
    }

    /// Stop the last worker. Returns whether it exited cleanly.
    fn shrink(&mut self) -> bool {
        let Some(worker) = self.workers.pop() else {
            return true;
        };
        let _ = worker.jobs.send(WorkerJob::Exit);
        drop(worker.jobs);
        let clean = worker.thread.join().is_ok();
        if !clean {
            tracing::warn!(worker = worker.id.0, "worker panicked before exit");
        }
        clean
    }

    fn gate_for(&self, region: RegionCoord) -> Option<Arc<PartitionGate>> {
        let p = self.assignments.get(&region)?;
        self.partitions.get(p.index()).map(|p| Arc::clone(p.gate()))
    }

    /// Register a region handle and hand it to its partition.
    fn observe_region(&mut self, world: &World, handle: Arc<RegionHandle>) -> Option<RegionCoord> {
        let coord = handle.boundary_access(|r| r.coord()).ok()?;
        if world.region(coord).is_some() {
            tracing::debug!(region = %coord, "region already loaded");
            return None;
        }
        let p = self.assign(coord);
        if let Some(partition) = self.partitions.get(p.index()) {
            partition.adopt(coord, Arc::clone(&handle));
        }
        world.insert_region(coord, handle);
        Some(coord)
    }

    /// The live region at `coord`, loading flat terrain if absent.
    fn ensure_region(
        &mut self,
        world: &World,
        coord: RegionCoord,
        report: &mut BoundaryReport,
    ) -> Option<Arc<RegionHandle>> {
        if let Some(h) = world.region(coord) {
            return Some(h);
        }
        let handle = Arc::new(SafeHandle::new(
            Region::new(coord),
            Arc::clone(world.acquire_stats()),
        ));
        self.observe_region(world, Arc::clone(&handle))?;
        report.regions_loaded += 1;
        Some(handle)
    }

    /// Put `object` into the region at `coord` under that region's gate.
    fn place(
        &mut self,
        world: &World,
        id: ObjectId,
        object: &Arc<ObjectHandle>,
        coord: RegionCoord,
        tick: TickId,
        report: &mut BoundaryReport,
    ) -> Result<(), SimulationFault> {
        let region = self
            .ensure_region(world, coord, report)
            .ok_or_else(|| SimulationFault::Update {
                reason: format!("region {coord} could not be loaded"),
            })?;
        region.boundary_access(|r| r.insert_object(id, Arc::clone(object)))?;
        object.boundary_access(|o| o.set_region(coord))?;
        object.set_gate(self.gate_for(coord));
        object.publish(tick)?;
        region.publish(tick)?;
        Ok(())
    }

    /// Take `id` out of the world and invalidate its handle.
    fn finalize_removal(&self, world: &World, id: ObjectId, tick: TickId) -> bool {
        let Some(object) = world.remove_object(id) else {
            return false;
        };
        if let Ok(coord) = object.boundary_access(|o| o.region()) {
            if let Some(region) = world.region(coord) {
                let _ = region.boundary_access(|r| r.remove_object(id));
                let _ = region.publish(tick);
            }
        }
        object.invalidate();
        true
    }

    fn boundary_fault(&self, tick: TickId, fault: SimulationFault, object: Option<ObjectId>) {
        let mut ctx = FaultContext::new(tick, FaultPhase::Boundary);
        ctx.object = object;
        self.sink.record(&fault, &ctx);
    }

    /// Apply queued region loads, spawns and removals.
    ///
    /// Runs on the driver thread at the start of the simulation step,
    /// before [`simulate`](Self::simulate).
    pub fn synchronize(&mut self, world: &World, tick: TickId) -> BoundaryReport {
        let mut report = BoundaryReport::default();
        let pending = world.take_pending();
        if pending.is_empty() {
            return report;
        }

        for region in pending.regions {
            let handle = Arc::new(SafeHandle::new(region, Arc::clone(world.acquire_stats())));
            if self.observe_region(world, handle).is_some() {
                report.regions_loaded += 1;
            }
        }

        for (id, object) in pending.spawns {
            if object.is_invalidated() {
                continue;
            }
            let position = object.boundary_access(|o| RegionCoord::containing(o.position()));
            let coord = match position {
                Ok(c) => c,
                Err(e) => {
                    self.boundary_fault(tick, e.into(), Some(id));
                    report.faults += 1;
                    continue;
                }
            };
            match self.place(world, id, &object, coord, tick, &mut report) {
                Ok(()) => {
                    world.insert_object(id, object);
                    report.spawned += 1;
                }
                Err(fault) => {
                    self.boundary_fault(tick, fault, Some(id));
                    report.faults += 1;
                }
            }
        }

        for id in pending.removals {
            if self.finalize_removal(world, id, tick) {
                report.removed += 1;
            }
        }

        tracing::debug!(
            tick = tick.0,
            loaded = report.regions_loaded,
            spawned = report.spawned,
            removed = report.removed,
            "boundary synchronized"
        );
        report
    }

    /// Run one segment per partition in parallel and wait for all of them.
    ///
    /// Returns only after every worker has replied. A worker that
    /// disappears mid-tick is fatal.
    pub fn simulate(&mut self, tick: TickContext) -> Result<SimulationReport, FatalError> {
        let started = Instant::now();
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(self.workers.len());

        let mut dispatched = Vec::with_capacity(self.workers.len());
        let mut lost = None;
        for (worker, partition) in self.workers.iter().zip(&self.partitions) {
            let job = WorkerJob::Segment {
                partition: Arc::clone(partition),
                tick,
                reply: reply_tx.clone(),
            };
            if worker.jobs.send(job).is_err() {
                lost.get_or_insert(partition.id());
                continue;
            }
            dispatched.push(partition.id());
        }
        drop(reply_tx);

        // Barrier: every dispatched segment reports back, even if a
        // sibling worker is gone.
        let mut segments = Vec::with_capacity(dispatched.len());
        while segments.len() < dispatched.len() {
            match reply_rx.recv() {
                Ok(report) => segments.push(report),
                Err(_) => break,
            }
        }
        if segments.len() < dispatched.len() {
            let missing = dispatched
                .iter()
                .find(|p| !segments.iter().any(|s: &SegmentReport| s.partition == **p))
                .copied();
            lost = lost.or(missing);
        }
        if let Some(partition) = lost {
            return Err(FatalError::WorkerLost { partition });
        }

        segments.sort_by_key(|s| s.partition);
        Ok(SimulationReport {
            tick: tick.tick,
            segments,
            elapsed: started.elapsed(),
        })
    }

    /// Apply migrations and removal requests produced by a round.
    pub fn apply_outcomes(
        &mut self,
        world: &World,
        outcome: &SimulationReport,
        tick: TickId,
    ) -> BoundaryReport {
        let mut report = BoundaryReport::default();
        for segment in &outcome.segments {
            for m in &segment.migrations {
                let Some(object) = world.object(m.object) else {
                    continue;
                };
                if let Some(from) = world.region(m.from) {
                    let _ = from.boundary_access(|r| r.remove_object(m.object));
                    let _ = from.publish(tick);
                }
                match self.place(world, m.object, &object, m.to, tick, &mut report) {
                    Ok(()) => {
                        report.migrated += 1;
                        tracing::trace!(object = m.object.0, from = %m.from, to = %m.to, "migrated");
                    }
                    Err(fault) => {
                        // Stay in the old region rather than in none.
                        if let Some(from) = world.region(m.from) {
                            let _ = from.boundary_access(|r| {
                                r.insert_object(m.object, Arc::clone(&object))
                            });
                        }
                        self.boundary_fault(tick, fault, Some(m.object));
                        report.faults += 1;
                    }
                }
            }
        }
        for segment in &outcome.segments {
            for id in &segment.removals {
                if self.finalize_removal(world, *id, tick) {
                    report.removed += 1;
                }
            }
        }
        report
    }

    /// Change the pool to `target` threads and rebalance regions.
    ///
    /// Must not overlap [`simulate`](Self::simulate); `&mut self` enforces
    /// that. `nanos_remaining` bounds the work: growth stops once it is
    /// spent, and nothing happens at all if it is not positive. The
    /// budget is advisory; a miss is logged, not an error.
    pub fn resize(&mut self, target: usize, nanos_remaining: i64) -> ResizeReport {
        let previous = self.workers.len();
        let target = target.clamp(1, MAX_WORKERS);
        if target == previous || self.workers_stopped {
            return ResizeReport::unchanged(previous);
        }
        if nanos_remaining <= 0 {
            tracing::debug!(previous, target, "no time left in tick, resize deferred");
            let mut report = ResizeReport::unchanged(previous);
            report.within_budget = false;
            return report;
        }

        let started = Instant::now();
        let budget = Duration::from_nanos(nanos_remaining as u64);
        let mut orphaned: IndexMap<RegionCoord, Arc<RegionHandle>> = IndexMap::new();

        if target > previous {
            while self.workers.len() < target {
                if started.elapsed() >= budget {
                    break;
                }
                if let Err(e) = self.grow() {
                    tracing::warn!(error = %e, "could not grow worker pool");
                    break;
                }
            }
        } else {
            while self.workers.len() > target {
                self.shrink();
                if let Some(partition) = self.partitions.pop() {
                    orphaned.extend(partition.release_all());
                }
            }
        }

        let threads = self.workers.len();
        let regions: Vec<RegionCoord> = self.assignments.keys().copied().collect();
        let mapping = self.policy.rebalance(&regions, threads);
        let mut moved = 0;
        for (coord, new) in mapping {
            let old = self.assignments.insert(coord, new);
            let handle = match orphaned.shift_remove(&coord) {
                Some(h) => Some(h),
                None if old != Some(new) => old
                    .and_then(|p| self.partitions.get(p.index()))
                    .and_then(|p| p.release(coord)),
                None => None,
            };
            if let (Some(handle), Some(partition)) = (handle, self.partitions.get(new.index())) {
                partition.adopt(coord, Arc::clone(&handle));
                // Same generation, new partition: snapshots see the move.
                let generation = handle.latest_view().generation;
                let _ = handle.publish(generation);
                moved += 1;
            }
        }

        let elapsed = started.elapsed();
        let within_budget = elapsed <= budget;
        if !within_budget {
            tracing::warn!(?elapsed, ?budget, "pool resize overran its budget");
        }
        tracing::info!(previous, current = threads, moved, "worker pool resized");
        ResizeReport {
            previous,
            current: threads,
            regions_moved: moved,
            within_budget,
            elapsed,
        }
    }

    /// Stop every worker thread. Idempotent.
    pub fn stop_workers(&mut self) -> PoolShutdownReport {
        let mut report = PoolShutdownReport::default();
        if self.workers_stopped {
            return report;
        }
        self.workers_stopped = true;
        for worker in &self.workers {
            let _ = worker.jobs.send(WorkerJob::Exit);
        }
        for worker in self.workers.drain(..) {
            drop(worker.jobs);
            if worker.thread.join().is_ok() {
                report.workers_joined += 1;
            } else {
                report.workers_panicked += 1;
            }
        }
        tracing::info!(joined = report.workers_joined, "worker pool stopped");
        report
    }

    /// Release every region from every partition. Idempotent.
    pub fn release_partitions(&mut self) -> usize {
        let released: usize = self
            .partitions
            .drain(..)
            .map(|p| p.release_all().len())
            .sum();
        self.assignments.clear();
        if released > 0 {
            tracing::info!(released, "partitions released");
        }
        released
    }

    /// Stop the pool, then release the partitions. Idempotent.
    pub fn shutdown(&mut self) -> PoolShutdownReport {
        let mut report = self.stop_workers();
        report.regions_released = self.release_partitions();
        report
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop_workers();
    }
}
