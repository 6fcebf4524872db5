//! Region assignment across pool resizes.

use std::collections::BTreeSet;
use std::sync::Arc;

use tessel_core::{PartitionId, RegionCoord, TickId};
use tessel_engine::{Dispatcher, ExceptionSink, Locality, TickContext, World};
use tessel_test_utils::{load_row, round_robin_dispatcher, spawn_in, CountingBehavior, RecordingSink};

fn xs(dispatcher: &Dispatcher, partition: usize) -> BTreeSet<i32> {
    dispatcher.partitions()[partition]
        .regions()
        .into_iter()
        .map(|c| c.x)
        .collect()
}

fn sink() -> Arc<dyn ExceptionSink> {
    Arc::new(RecordingSink::new())
}

#[test]
fn round_robin_spreads_then_rebalances_on_shrink() {
    let world = World::new();
    let mut dispatcher = round_robin_dispatcher(4, sink());
    load_row(&world, 8);
    let report = dispatcher.synchronize(&world, TickId(1));
    assert_eq!(report.regions_loaded, 8);

    assert_eq!(xs(&dispatcher, 0), BTreeSet::from([0, 4]));
    assert_eq!(xs(&dispatcher, 1), BTreeSet::from([1, 5]));
    assert_eq!(xs(&dispatcher, 3), BTreeSet::from([3, 7]));

    let resize = dispatcher.resize(2, i64::MAX);
    assert!(resize.changed());
    assert!(resize.within_budget);
    assert_eq!(dispatcher.thread_count(), 2);
    assert_eq!(dispatcher.partition_count(), 2);
    assert_eq!(xs(&dispatcher, 0), BTreeSet::from([0, 2, 4, 6]));
    assert_eq!(xs(&dispatcher, 1), BTreeSet::from([1, 3, 5, 7]));

    // Every region's handle follows its new partition's gate.
    for x in 0..8 {
        let coord = RegionCoord::new(x, 0);
        let handle = world.region(coord).unwrap();
        assert_eq!(handle.partition(), dispatcher.partition_of(coord));
        assert_eq!(
            handle.access(|r| r.partition()).unwrap(),
            dispatcher.partition_of(coord)
        );
    }
}

#[test]
fn objects_follow_their_region_through_a_resize() {
    let world = World::new();
    let mut dispatcher = round_robin_dispatcher(4, sink());
    let coords = load_row(&world, 8);
    let counter = CountingBehavior::new();
    let handles: Vec<_> = coords
        .iter()
        .map(|c| spawn_in(&world, *c, counter.clone()))
        .collect();
    dispatcher.synchronize(&world, TickId(1));
    dispatcher.simulate(TickContext::new(TickId(1), 0)).unwrap();

    dispatcher.resize(3, i64::MAX);
    for (coord, handle) in coords.iter().zip(&handles) {
        assert_eq!(handle.partition(), dispatcher.partition_of(*coord));
    }
    let report = dispatcher.simulate(TickContext::new(TickId(2), 0)).unwrap();
    assert_eq!(report.objects_updated(), 8);
    assert_eq!(report.segments.len(), 3);
    assert_eq!(counter.updates(), 16);
}

#[test]
fn growing_the_pool_rebalances_without_losing_regions() {
    let world = World::new();
    let mut dispatcher = round_robin_dispatcher(2, sink());
    load_row(&world, 6);
    dispatcher.synchronize(&world, TickId(1));

    let resize = dispatcher.resize(3, i64::MAX);
    assert_eq!((resize.previous, resize.current), (2, 3));
    let total: usize = dispatcher.partitions().iter().map(|p| p.region_count()).sum();
    assert_eq!(total, 6);
    for p in dispatcher.partitions() {
        assert_eq!(p.region_count(), 2);
    }
}

#[test]
fn locality_keeps_stripes_together() {
    let world = World::new();
    let mut dispatcher = Dispatcher::new(2, Box::new(Locality::new(4)), sink()).unwrap();
    load_row(&world, 8);
    dispatcher.synchronize(&world, TickId(1));
    assert_eq!(dispatcher.policy().name(), "locality");
    for x in 0..4 {
        assert_eq!(
            dispatcher.partition_of(RegionCoord::new(x, 0)),
            Some(PartitionId(0))
        );
        assert_eq!(
            dispatcher.partition_of(RegionCoord::new(x + 4, 0)),
            Some(PartitionId(1))
        );
    }
}
