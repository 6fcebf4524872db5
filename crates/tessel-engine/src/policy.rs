//! Region-to-partition assignment strategies.

use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use tessel_core::{PartitionId, RegionCoord};

/// Decides which partition owns a region.
///
/// The dispatcher calls [`assign`](Self::assign) once per newly observed
/// region and [`rebalance`](Self::rebalance) after every pool resize.
/// Existing regions are not moved when new ones arrive; a policy that
/// wants that has to do it from `rebalance`.
pub trait AssignmentPolicy: Send + Sync {
    /// Short label for logs.
    fn name(&self) -> &str;

    /// Partition for a region seen for the first time.
    fn assign(&self, region: RegionCoord, thread_count: usize) -> PartitionId;

    /// Full mapping for `regions` (in first-observed order) against a new
    /// thread count.
    fn rebalance(
        &self,
        regions: &[RegionCoord],
        thread_count: usize,
    ) -> IndexMap<RegionCoord, PartitionId>;
}

fn modulo(n: u64, thread_count: usize) -> PartitionId {
    PartitionId((n % thread_count.max(1) as u64) as u32)
}

/// Round-robin by observation order. The default.
///
/// O(1) assignment and an even region count per partition, with no
/// notion of locality.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicU64,
}

impl RoundRobin {
    /// A policy whose next assignment goes to partition 0.
    pub fn new() -> Self {
        Self::default()
    }
}

impl AssignmentPolicy for RoundRobin {
    fn name(&self) -> &str {
        "round-robin"
    }

    fn assign(&self, _region: RegionCoord, thread_count: usize) -> PartitionId {
        modulo(self.counter.fetch_add(1, Ordering::Relaxed), thread_count)
    }

    fn rebalance(
        &self,
        regions: &[RegionCoord],
        thread_count: usize,
    ) -> IndexMap<RegionCoord, PartitionId> {
        let mapping = regions
            .iter()
            .enumerate()
            .map(|(i, r)| (*r, modulo(i as u64, thread_count)))
            .collect();
        // Continue the sequence after the last rebalanced region.
        self.counter.store(regions.len() as u64, Ordering::Relaxed);
        mapping
    }
}

/// Groups neighbouring regions: stripes of `stripe` columns along X go
/// to the same partition, so most migrations stay partition-local.
#[derive(Clone, Copy, Debug)]
pub struct Locality {
    stripe: u32,
}

impl Locality {
    /// Stripes `stripe` regions wide (minimum 1).
    pub fn new(stripe: u32) -> Self {
        Self {
            stripe: stripe.max(1),
        }
    }

    fn partition_for(&self, region: RegionCoord, thread_count: usize) -> PartitionId {
        let band = i64::from(region.x).div_euclid(i64::from(self.stripe));
        PartitionId(band.rem_euclid(thread_count.max(1) as i64) as u32)
    }
}

impl Default for Locality {
    fn default() -> Self {
        Self::new(4)
    }
}

impl AssignmentPolicy for Locality {
    fn name(&self) -> &str {
        "locality"
    }

    fn assign(&self, region: RegionCoord, thread_count: usize) -> PartitionId {
        self.partition_for(region, thread_count)
    }

    fn rebalance(
        &self,
        regions: &[RegionCoord],
        thread_count: usize,
    ) -> IndexMap<RegionCoord, PartitionId> {
        regions
            .iter()
            .map(|r| (*r, self.partition_for(*r, thread_count)))
            .collect()
    }
}
