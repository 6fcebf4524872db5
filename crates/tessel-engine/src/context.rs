//! Per-tick inputs handed to region and object updates.

use tessel_core::{RegionCoord, TickId, Vec3};

use crate::region::REGION_COLUMNS;

/// Describes the tick being simulated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickContext {
    /// The tick being simulated.
    pub tick: TickId,
    /// Monotonic nanoseconds at the start of the tick.
    pub tick_start_ns: u64,
    /// Advisory nanosecond budget for the parallel phase.
    pub budget_ns: u64,
}

impl TickContext {
    /// Context for `tick` with no budget hint.
    pub fn new(tick: TickId, tick_start_ns: u64) -> Self {
        Self {
            tick,
            tick_start_ns,
            budget_ns: 0,
        }
    }

    /// Attach a budget hint.
    pub fn with_budget(mut self, budget_ns: u64) -> Self {
        self.budget_ns = budget_ns;
        self
    }
}

/// What a single object update can see of its surroundings.
///
/// Built by the partition worker once per region; `terrain` is the
/// region's column heights after this tick's edits were applied.
#[derive(Clone, Copy, Debug)]
pub struct UpdateContext<'a> {
    /// The tick being simulated.
    pub tick: TickId,
    /// Monotonic nanoseconds at the start of the tick.
    pub tick_start_ns: u64,
    /// The region the object belonged to when the tick started.
    pub region: RegionCoord,
    terrain: &'a [u16],
}

impl<'a> UpdateContext<'a> {
    /// Context for objects in `region` with the given terrain.
    pub fn new(tick: &TickContext, region: RegionCoord, terrain: &'a [u16]) -> Self {
        Self {
            tick: tick.tick,
            tick_start_ns: tick.tick_start_ns,
            region,
            terrain,
        }
    }

    /// Ground height under `pos`, if `pos` lies inside this context's region.
    pub fn ground_height(&self, pos: Vec3) -> Option<f64> {
        if RegionCoord::containing(pos) != self.region {
            return None;
        }
        let origin = self.region.origin();
        let lx = ((pos.x - origin.x).floor() as usize).min(REGION_COLUMNS - 1);
        let lz = ((pos.z - origin.z).floor() as usize).min(REGION_COLUMNS - 1);
        self.terrain
            .get(lz * REGION_COLUMNS + lx)
            .map(|h| f64::from(*h))
    }
}
