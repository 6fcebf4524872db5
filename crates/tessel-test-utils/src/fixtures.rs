//! Reusable object behaviours and world fixtures.
//!
//! - [`FailingBehavior`]: returns an update error on chosen ticks.
//! - [`PanickingBehavior`]: panics on every update.
//! - [`CountingBehavior`]: counts updates and remembers which thread ran them.
//! - [`SlowBehavior`]: sleeps inside its update, to hold a partition gate.
//! - [`ExclusiveBehavior`]: counts overlapping entries from its update and
//!   from outside closures.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tessel_core::{RegionCoord, SimulationFault, Vec3};
use tessel_engine::{
    Dispatcher, ExceptionSink, ObjectBehavior, ObjectHandle, ObjectSpec, ObjectState, Region,
    RoundRobin, UpdateContext, World,
};

/// Fails on every update whose tick is in `ticks`, or always if empty.
pub struct FailingBehavior {
    ticks: HashSet<u64>,
}

impl FailingBehavior {
    pub fn always() -> Self {
        Self {
            ticks: HashSet::new(),
        }
    }

    pub fn on_ticks(ticks: impl IntoIterator<Item = u64>) -> Self {
        Self {
            ticks: ticks.into_iter().collect(),
        }
    }
}

impl ObjectBehavior for FailingBehavior {
    fn name(&self) -> &str {
        "failing"
    }

    fn update(
        &mut self,
        _state: &mut ObjectState,
        ctx: &UpdateContext<'_>,
    ) -> Result<(), SimulationFault> {
        if self.ticks.is_empty() || self.ticks.contains(&ctx.tick.0) {
            return Err(SimulationFault::Update {
                reason: format!("scripted failure at tick {}", ctx.tick),
            });
        }
        Ok(())
    }
}

/// Panics on every update.
pub struct PanickingBehavior;

impl ObjectBehavior for PanickingBehavior {
    fn name(&self) -> &str {
        "panicking"
    }

    fn update(
        &mut self,
        _state: &mut ObjectState,
        _ctx: &UpdateContext<'_>,
    ) -> Result<(), SimulationFault> {
        panic!("behaviour exploded")
    }
}

/// Counts updates and records the updating threads.
#[derive(Clone, Default)]
pub struct CountingBehavior {
    updates: Arc<AtomicU64>,
    threads: Arc<Mutex<HashSet<ThreadId>>>,
}

impl CountingBehavior {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().map(|t| t.len()).unwrap_or(0)
    }
}

impl ObjectBehavior for CountingBehavior {
    fn name(&self) -> &str {
        "counting"
    }

    fn update(
        &mut self,
        _state: &mut ObjectState,
        _ctx: &UpdateContext<'_>,
    ) -> Result<(), SimulationFault> {
        self.updates.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut threads) = self.threads.lock() {
            threads.insert(thread::current().id());
        }
        Ok(())
    }
}

/// Sleeps for a fixed time in every update.
pub struct SlowBehavior(pub Duration);

impl ObjectBehavior for SlowBehavior {
    fn name(&self) -> &str {
        "slow"
    }

    fn update(
        &mut self,
        _state: &mut ObjectState,
        _ctx: &UpdateContext<'_>,
    ) -> Result<(), SimulationFault> {
        thread::sleep(self.0);
        Ok(())
    }
}

/// Detects two threads inside one object at once.
///
/// The update and any outside access closure call
/// [`enter`](Self::enter); an entry while another is in progress is
/// counted as an overlap.
#[derive(Clone, Default)]
pub struct ExclusiveBehavior {
    inside: Arc<AtomicU64>,
    overlaps: Arc<AtomicU64>,
    entries: Arc<AtomicU64>,
}

impl ExclusiveBehavior {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark this thread inside the object for `linger`.
    pub fn enter(&self, linger: Duration) {
        if self.inside.fetch_add(1, Ordering::SeqCst) != 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.entries.fetch_add(1, Ordering::SeqCst);
        if linger.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(linger);
        }
        self.inside.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn overlaps(&self) -> u64 {
        self.overlaps.load(Ordering::SeqCst)
    }

    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::SeqCst)
    }
}

impl ObjectBehavior for ExclusiveBehavior {
    fn name(&self) -> &str {
        "exclusive"
    }

    fn update(
        &mut self,
        _state: &mut ObjectState,
        _ctx: &UpdateContext<'_>,
    ) -> Result<(), SimulationFault> {
        self.enter(Duration::from_micros(200));
        Ok(())
    }
}

/// A point in the middle of `coord`, just above default ground level.
pub fn region_center(coord: RegionCoord) -> Vec3 {
    coord.origin() + Vec3::new(8.0, 70.0, 8.0)
}

/// Queue flat regions `(0, 0)` to `(count - 1, 0)`, in order.
pub fn load_row(world: &World, count: i32) -> Vec<RegionCoord> {
    (0..count)
        .map(|x| {
            let coord = RegionCoord::new(x, 0);
            world.load_region(Region::new(coord));
            coord
        })
        .collect()
}

/// Spawn a custom-behaviour object at rest in the middle of `coord`.
pub fn spawn_in(
    world: &World,
    coord: RegionCoord,
    behavior: impl ObjectBehavior,
) -> Arc<ObjectHandle> {
    world.spawn(ObjectSpec::custom(region_center(coord), behavior))
}

/// A round-robin dispatcher with `threads` workers.
pub fn round_robin_dispatcher(threads: usize, sink: Arc<dyn ExceptionSink>) -> Dispatcher {
    match Dispatcher::new(threads, Box::new(RoundRobin::new()), sink) {
        Ok(d) => d,
        Err(e) => panic!("dispatcher failed to start: {e}"),
    }
}
