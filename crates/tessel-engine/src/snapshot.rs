//! Point-in-time views of the whole world.
//!
//! [`SnapshotService::capture`] collects the most recently published
//! view of every live region and object. It never enters a partition
//! gate or a handle lock, so it is safe to call while a tick is being
//! simulated. Each view is internally consistent; consistency across
//! views is best-effort, since partitions publish independently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use tessel_core::{ObjectId, RegionCoord, TickId};

use crate::clock::monotonic_nanos;
use crate::object::ObjectView;
use crate::region::RegionView;

/// Anything that can hand out published views.
pub trait ViewSource {
    /// Latest view of every live region.
    fn region_views(&self) -> Vec<Arc<RegionView>>;

    /// Latest view of every live object.
    fn object_views(&self) -> Vec<Arc<ObjectView>>;
}

/// An immutable aggregate of region and object views.
///
/// Cheap to clone; clones share the same views.
#[derive(Clone, Debug)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

#[derive(Debug)]
struct SnapshotInner {
    captured_at_ns: u64,
    regions: IndexMap<RegionCoord, Arc<RegionView>>,
    objects: IndexMap<ObjectId, Arc<ObjectView>>,
}

// Compile-time assertion: snapshots are shared across threads.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Snapshot>();
};

impl Snapshot {
    /// Monotonic nanoseconds when capture started.
    pub fn captured_at_ns(&self) -> u64 {
        self.inner.captured_at_ns
    }

    /// The view of the region at `coord`.
    pub fn region(&self, coord: RegionCoord) -> Option<&RegionView> {
        self.inner.regions.get(&coord).map(|v| &**v)
    }

    /// The view of object `id`.
    pub fn object(&self, id: ObjectId) -> Option<&ObjectView> {
        self.inner.objects.get(&id).map(|v| &**v)
    }

    /// Objects listed as members of `coord` in that region's view.
    pub fn objects_in(&self, coord: RegionCoord) -> Vec<&ObjectView> {
        self.region(coord)
            .map(|r| r.objects.iter().filter_map(|id| self.object(*id)).collect())
            .unwrap_or_default()
    }

    /// Every region view.
    pub fn regions(&self) -> impl Iterator<Item = &RegionView> {
        self.inner.regions.values().map(|v| &**v)
    }

    /// Every object view.
    pub fn objects(&self) -> impl Iterator<Item = &ObjectView> {
        self.inner.objects.values().map(|v| &**v)
    }

    /// Number of region views.
    pub fn region_count(&self) -> usize {
        self.inner.regions.len()
    }

    /// Number of object views.
    pub fn object_count(&self) -> usize {
        self.inner.objects.len()
    }

    /// Oldest and newest view generation, or `None` when empty.
    ///
    /// A spread wider than one tick means some partitions published
    /// while the capture was running.
    pub fn generation_range(&self) -> Option<(TickId, TickId)> {
        let gens = self
            .inner
            .regions
            .values()
            .map(|r| r.generation)
            .chain(self.inner.objects.values().map(|o| o.generation));
        gens.fold(None, |acc, g| match acc {
            None => Some((g, g)),
            Some((lo, hi)) => Some((lo.min(g), hi.max(g))),
        })
    }
}

/// Produces [`Snapshot`]s.
#[derive(Debug, Default)]
pub struct SnapshotService {
    captures: AtomicU64,
}

impl SnapshotService {
    /// A new service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect the latest view of everything `source` holds.
    pub fn capture(&self, source: &dyn ViewSource) -> Snapshot {
        let captured_at_ns = monotonic_nanos();
        let regions = source
            .region_views()
            .into_iter()
            .map(|v| (v.coord, v))
            .collect();
        let objects = source
            .object_views()
            .into_iter()
            .map(|v| (v.id, v))
            .collect();
        self.captures.fetch_add(1, Ordering::Relaxed);
        Snapshot {
            inner: Arc::new(SnapshotInner {
                captured_at_ns,
                regions,
                objects,
            }),
        }
    }

    /// Snapshots captured so far.
    pub fn captures(&self) -> u64 {
        self.captures.load(Ordering::Relaxed)
    }
}
