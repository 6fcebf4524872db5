//! Benchmark profiles and utilities for the Tessel tick engine.
//!
//! Provides pre-built world populations for benchmarking:
//!
//! - [`REFERENCE`]: 8x8 regions, 640 objects, 4 workers
//! - [`STRESS`]: 16x16 regions, 5120 objects, 8 workers
//! - [`populate`]: deterministic object placement via seed

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::sync::Arc;
use std::time::Duration;

use rand_chacha::rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tessel_core::{RegionCoord, Vec3, REGION_SIZE};
use tessel_engine::{
    Dispatcher, ItemStack, LoggingSink, NoopObserver, NullNetwork, ObjectSpec, Region,
    RoundRobin, TaskQueue, TickClock, TickDriver, TickParts, World,
};

/// Size of a benchmark world.
#[derive(Clone, Copy, Debug)]
pub struct Profile {
    /// Regions along each side of the square grid.
    pub side: i32,
    /// Wandering creatures per region.
    pub creatures_per_region: usize,
    /// Dropped items per region.
    pub items_per_region: usize,
    /// Dispatcher worker threads.
    pub threads: usize,
}

impl Profile {
    /// Regions in the grid.
    pub fn regions(&self) -> usize {
        (self.side * self.side) as usize
    }

    /// Objects spawned by [`populate`].
    pub fn objects(&self) -> usize {
        self.regions() * (self.creatures_per_region + self.items_per_region)
    }
}

/// 64 regions, 640 objects, 4 workers.
pub const REFERENCE: Profile = Profile {
    side: 8,
    creatures_per_region: 8,
    items_per_region: 2,
    threads: 4,
};

/// 256 regions, 5120 objects, 8 workers.
pub const STRESS: Profile = Profile {
    side: 16,
    creatures_per_region: 16,
    items_per_region: 4,
    threads: 8,
};

/// Queue the profile's regions and objects into `world`.
///
/// Positions and wander seeds come from a ChaCha8 stream, so a given
/// `seed` always produces the same world.
pub fn populate(world: &World, profile: &Profile, seed: u64) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    for x in 0..profile.side {
        for z in 0..profile.side {
            let coord = RegionCoord::new(x, z);
            world.load_region(Region::new(coord));
            for _ in 0..profile.creatures_per_region {
                let pos = random_position(&mut rng, coord);
                world.spawn(ObjectSpec::wandering_creature(pos, 20.0, rng.next_u64(), 0.2));
            }
            for _ in 0..profile.items_per_region {
                let pos = random_position(&mut rng, coord);
                let stack = ItemStack {
                    material: rng.next_u32() % 512,
                    amount: (rng.next_u32() % 64) as u8 + 1,
                };
                world.spawn(ObjectSpec::item(pos, stack));
            }
        }
    }
}

fn random_position(rng: &mut ChaCha8Rng, coord: RegionCoord) -> Vec3 {
    let unit = |rng: &mut ChaCha8Rng| f64::from(rng.next_u32() % 10_000) / 10_000.0;
    let local = Vec3::new(unit(rng) * REGION_SIZE, 64.0 + unit(rng) * 4.0, unit(rng) * REGION_SIZE);
    coord.origin() + local
}

/// A populated world and an idle driver with null collaborators.
///
/// The period is long enough that a tick never overruns or resizes.
pub fn build_driver(profile: &Profile, seed: u64) -> (Arc<World>, TickDriver) {
    let world = Arc::new(World::new());
    populate(&world, profile, seed);
    let sink = Arc::new(LoggingSink::new());
    let dispatcher =
        match Dispatcher::new(profile.threads, Box::new(RoundRobin::new()), sink.clone()) {
            Ok(d) => d,
            Err(e) => panic!("benchmark dispatcher failed to start: {e}"),
        };
    let driver = TickDriver::new(TickParts {
        world: Arc::clone(&world),
        dispatcher,
        scheduler: Box::new(TaskQueue::new()),
        network: Box::new(NullNetwork::new()),
        observer: Box::new(NoopObserver),
        sink,
        clock: Arc::new(TickClock::new()),
        period: Duration::from_secs(1),
        max_catch_up: 0,
    });
    (world, driver)
}
