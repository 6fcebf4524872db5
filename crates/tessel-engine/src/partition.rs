//! Partitions: disjoint sets of regions simulated by one worker.
//!
//! [`Partition::run_segment`] is the whole per-tick job of a worker:
//!
//! 1. Enter the partition gate, shutting out non-owner accesses.
//! 2. Tag every member region and object with the worker's token.
//! 3. Update each region, then each of its objects. A failing or
//!    panicking update is reported and skips only that region or
//!    object for the rest of the tick.
//! 4. Publish fresh views, clear the tags, leave the gate.
//!
//! Membership is read once at the start, so objects that move into
//! another region stay in this segment until the boundary applies the
//! migration.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tessel_core::{
    AccessError, FaultContext, FaultPhase, ObjectId, PartitionId, RegionCoord, SimulationFault,
};

use crate::context::{TickContext, UpdateContext};
use crate::handle::{PartitionGate, WorkerToken};
use crate::object::ObjectHandle;
use crate::region::RegionHandle;
use crate::sink::ExceptionSink;

/// An object whose position left its region during a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Migration {
    /// The moving object.
    pub object: ObjectId,
    /// Region it is a member of until the boundary.
    pub from: RegionCoord,
    /// Region containing its new position.
    pub to: RegionCoord,
}

/// What one partition segment did.
#[derive(Clone, Debug)]
pub struct SegmentReport {
    /// The partition simulated.
    pub partition: PartitionId,
    /// Regions whose update completed.
    pub regions_updated: usize,
    /// Objects whose update completed.
    pub objects_updated: usize,
    /// Faults recorded to the sink.
    pub faults: usize,
    /// Objects to move at the boundary.
    pub migrations: Vec<Migration>,
    /// Objects that asked to be removed.
    pub removals: Vec<ObjectId>,
    /// Wall time of the segment, gate wait included.
    pub elapsed: Duration,
}

impl SegmentReport {
    pub(crate) fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            regions_updated: 0,
            objects_updated: 0,
            faults: 0,
            migrations: Vec::new(),
            removals: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Run `f`, converting a panic into a fault.
pub(crate) fn guarded<R>(f: impl FnOnce() -> R) -> Result<R, SimulationFault> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| SimulationFault::Panicked {
        message: panic_message(payload.as_ref()),
    })
}

/// Clears owner tags on drop, so a segment never leaves a handle tagged.
struct Ownership {
    regions: Vec<(RegionCoord, Arc<RegionHandle>)>,
    objects: Vec<Vec<(ObjectId, Arc<ObjectHandle>)>>,
}

impl Drop for Ownership {
    fn drop(&mut self) {
        for (_, r) in &self.regions {
            r.end_ownership();
        }
        for (_, o) in self.objects.iter().flatten() {
            o.end_ownership();
        }
    }
}

/// A set of regions simulated start-to-finish by one worker per tick.
#[derive(Debug)]
pub struct Partition {
    id: PartitionId,
    gate: Arc<PartitionGate>,
    regions: RwLock<IndexMap<RegionCoord, Arc<RegionHandle>>>,
}

impl Partition {
    pub(crate) fn new(id: PartitionId) -> Self {
        Self {
            id,
            gate: Arc::new(PartitionGate::new(id)),
            regions: RwLock::new(IndexMap::new()),
        }
    }

    /// This partition's id.
    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub(crate) fn gate(&self) -> &Arc<PartitionGate> {
        &self.gate
    }

    /// Member regions, in adoption order.
    pub fn regions(&self) -> Vec<RegionCoord> {
        self.read().keys().copied().collect()
    }

    /// Number of member regions.
    pub fn region_count(&self) -> usize {
        self.read().len()
    }

    /// Whether `coord` is a member.
    pub fn contains(&self, coord: RegionCoord) -> bool {
        self.read().contains_key(&coord)
    }

    /// Take ownership of a region and every object in it.
    ///
    /// Boundary only: no segment may be running.
    pub(crate) fn adopt(&self, coord: RegionCoord, handle: Arc<RegionHandle>) {
        let members = handle
            .boundary_access(|r| {
                r.set_partition(Some(self.id));
                r.object_handles()
            })
            .unwrap_or_default();
        for (_, o) in &members {
            o.set_gate(Some(Arc::clone(&self.gate)));
        }
        handle.set_gate(Some(Arc::clone(&self.gate)));
        self.write().insert(coord, handle);
    }

    /// Give up a region. Its handles keep the old gate until adopted.
    pub(crate) fn release(&self, coord: RegionCoord) -> Option<Arc<RegionHandle>> {
        self.write().shift_remove(&coord)
    }

    /// Give up every region and clear their gates.
    pub(crate) fn release_all(&self) -> Vec<(RegionCoord, Arc<RegionHandle>)> {
        let drained: Vec<_> = self.write().drain(..).collect();
        for (_, handle) in &drained {
            let members = handle
                .boundary_access(|r| {
                    r.set_partition(None);
                    r.object_handles()
                })
                .unwrap_or_default();
            for (_, o) in &members {
                o.set_gate(None);
            }
            handle.set_gate(None);
        }
        drained
    }

    /// Simulate every member region and object for one tick.
    pub(crate) fn run_segment(
        &self,
        token: WorkerToken,
        tick: &TickContext,
        sink: &dyn ExceptionSink,
    ) -> SegmentReport {
        let started = Instant::now();
        let mut report = SegmentReport::new(self.id);
        let _segment = self.gate.enter();

        let regions: Vec<_> = self
            .read()
            .iter()
            .map(|(c, h)| (*c, Arc::clone(h)))
            .collect();
        let mut owned = Ownership {
            regions,
            objects: Vec::new(),
        };
        for (_, r) in &owned.regions {
            r.begin_ownership(token);
        }
        for (coord, r) in &owned.regions {
            let members = match r.access(|reg| reg.object_handles()) {
                Ok(m) => m,
                Err(e) => {
                    self.report(sink, tick, &mut report, e.into(), Some(*coord), None);
                    Vec::new()
                }
            };
            for (_, o) in &members {
                o.begin_ownership(token);
            }
            owned.objects.push(members);
        }

        for ((coord, region), members) in owned.regions.iter().zip(&owned.objects) {
            self.run_region(tick, sink, &mut report, *coord, region, members);
        }

        for ((_, region), members) in owned.regions.iter().zip(&owned.objects) {
            for (_, o) in members {
                // Invalidated objects have nothing to publish.
                let _ = o.publish(tick.tick);
            }
            let _ = region.publish(tick.tick);
        }

        drop(owned);
        report.elapsed = started.elapsed();
        report
    }

    fn run_region(
        &self,
        tick: &TickContext,
        sink: &dyn ExceptionSink,
        report: &mut SegmentReport,
        coord: RegionCoord,
        region: &RegionHandle,
        members: &[(ObjectId, Arc<ObjectHandle>)],
    ) {
        match guarded(|| region.access(|r| r.update(tick))) {
            Ok(Ok(Ok(()))) => report.regions_updated += 1,
            // A region fault does not hold back the objects inside it.
            Ok(Ok(Err(fault))) | Err(fault) => {
                self.report(sink, tick, report, fault, Some(coord), None);
            }
            Ok(Err(access)) => {
                self.report(sink, tick, report, access.into(), Some(coord), None);
                return;
            }
        }
        let terrain = match region.access(|r| r.terrain_arc()) {
            Ok(t) => t,
            Err(access) => {
                self.report(sink, tick, report, access.into(), Some(coord), None);
                return;
            }
        };

        let ctx = UpdateContext::new(tick, coord, &terrain);
        for (id, object) in members {
            let outcome = guarded(|| {
                object.access(|o| {
                    let result = o.update(&ctx);
                    let now = RegionCoord::containing(o.position());
                    (result, o.region(), now, o.removal_requested())
                })
            });
            match outcome {
                Ok(Ok((Ok(()), from, to, remove))) => {
                    report.objects_updated += 1;
                    if remove {
                        report.removals.push(*id);
                    } else if from != to {
                        report.migrations.push(Migration {
                            object: *id,
                            from,
                            to,
                        });
                    }
                }
                Ok(Ok((Err(fault), ..))) | Err(fault) => {
                    self.report(sink, tick, report, fault, Some(coord), Some(*id));
                }
                // Removed from outside since the last boundary.
                Ok(Err(AccessError::Invalidated { .. })) => {}
                Ok(Err(access)) => {
                    self.report(sink, tick, report, access.into(), Some(coord), Some(*id));
                }
            }
        }
    }

    fn report(
        &self,
        sink: &dyn ExceptionSink,
        tick: &TickContext,
        report: &mut SegmentReport,
        fault: SimulationFault,
        region: Option<RegionCoord>,
        object: Option<ObjectId>,
    ) {
        let mut ctx = FaultContext::new(tick.tick, FaultPhase::Simulation).with_partition(self.id);
        ctx.region = region;
        ctx.object = object;
        sink.record(&fault, &ctx);
        report.faults += 1;
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexMap<RegionCoord, Arc<RegionHandle>>> {
        self.regions
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexMap<RegionCoord, Arc<RegionHandle>>> {
        self.regions
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{AcquireStats, SafeHandle};
    use crate::object::{DynamicObject, ObjectBehavior, ObjectSpec, ObjectState};
    use crate::region::Region;
    use std::sync::Mutex;
    use std::thread;
    use tessel_core::{TickId, Vec3};

    #[derive(Default)]
    struct Collect(Mutex<Vec<(SimulationFault, FaultContext)>>);

    impl ExceptionSink for Collect {
        fn record(&self, fault: &SimulationFault, context: &FaultContext) {
            self.0.lock().unwrap().push((fault.clone(), context.clone()));
        }
    }

    struct Boom;

    impl ObjectBehavior for Boom {
        fn name(&self) -> &str {
            "boom"
        }

        fn update(
            &mut self,
            _state: &mut ObjectState,
            _ctx: &UpdateContext<'_>,
        ) -> Result<(), SimulationFault> {
            panic!("boom");
        }
    }

    fn populate(partition: &Partition, specs: Vec<ObjectSpec>) -> Vec<Arc<ObjectHandle>> {
        let stats = Arc::new(AcquireStats::new());
        let coord = RegionCoord::new(0, 0);
        let mut region = Region::new(coord);
        let mut handles = Vec::new();
        for (i, spec) in specs.into_iter().enumerate() {
            let id = ObjectId(i as u64 + 1);
            let h = Arc::new(SafeHandle::new(DynamicObject::new(id, spec), Arc::clone(&stats)));
            region.insert_object(id, Arc::clone(&h));
            handles.push(h);
        }
        partition.adopt(coord, Arc::new(SafeHandle::new(region, stats)));
        handles
    }

    fn run(partition: &Arc<Partition>, sink: &Arc<Collect>) -> SegmentReport {
        let p = Arc::clone(partition);
        let s = Arc::clone(sink);
        thread::spawn(move || {
            let token = WorkerToken::allocate();
            token.install();
            p.run_segment(token, &TickContext::new(TickId(1), 0), &*s)
        })
        .join()
        .unwrap()
    }

    #[test]
    fn crossing_object_is_reported_not_moved() {
        let partition = Arc::new(Partition::new(PartitionId(1)));
        let handles = populate(
            &partition,
            vec![ObjectSpec::creature(Vec3::new(15.5, 64.0, 2.0), 10.0)
                .with_velocity(Vec3::new(1.0, 0.0, 0.0))],
        );
        let sink = Arc::new(Collect::default());
        let report = run(&partition, &sink);

        assert_eq!(report.regions_updated, 1);
        assert_eq!(report.objects_updated, 1);
        assert_eq!(
            report.migrations,
            vec![Migration {
                object: ObjectId(1),
                from: RegionCoord::new(0, 0),
                to: RegionCoord::new(1, 0),
            }]
        );
        let obj = &handles[0];
        assert_eq!(obj.access(|o| o.region()).unwrap(), RegionCoord::new(0, 0));
        assert_eq!(obj.latest_view().generation, TickId(1));
        assert_eq!(obj.partition(), Some(PartitionId(1)));
    }

    #[test]
    fn panicking_object_is_isolated() {
        let partition = Arc::new(Partition::new(PartitionId(0)));
        let handles = populate(
            &partition,
            vec![
                ObjectSpec::custom(Vec3::new(1.0, 64.0, 1.0), Boom),
                ObjectSpec::creature(Vec3::new(2.0, 64.0, 2.0), 10.0),
            ],
        );
        let sink = Arc::new(Collect::default());
        let report = run(&partition, &sink);

        assert_eq!(report.faults, 1);
        assert_eq!(report.objects_updated, 1);
        let faults = sink.0.lock().unwrap();
        assert!(matches!(faults[0].0, SimulationFault::Panicked { ref message } if message == "boom"));
        assert_eq!(faults[0].1.object, Some(ObjectId(1)));
        assert_eq!(faults[0].1.partition, Some(PartitionId(0)));
        // The panicking handle is still usable and untagged.
        assert_eq!(handles[0].access(|o| o.age_ticks()).unwrap(), 1);
        assert_eq!(handles[1].access(|o| o.age_ticks()).unwrap(), 1);
    }

    #[test]
    fn release_all_clears_gates() {
        let partition = Partition::new(PartitionId(2));
        let handles = populate(&partition, vec![ObjectSpec::creature(Vec3::ZERO, 1.0)]);
        assert!(partition.contains(RegionCoord::new(0, 0)));
        let released = partition.release_all();
        assert_eq!(released.len(), 1);
        assert_eq!(partition.region_count(), 0);
        assert_eq!(handles[0].partition(), None);
        assert_eq!(released[0].1.access(|r| r.partition()).unwrap(), None);
    }
}
