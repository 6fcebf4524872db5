//! The world registry: live region and object handles.
//!
//! Membership changes requested from outside the tick (region loads,
//! spawns, removals) are queued and applied by the dispatcher at the
//! next tick boundary, so a running partition segment never sees its
//! region set change underneath it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use indexmap::IndexMap;
use tessel_core::{ObjectId, RegionCoord};

use crate::handle::{lock_recover, AcquireStats, SafeHandle};
use crate::object::{DynamicObject, ObjectHandle, ObjectSpec, ObjectView};
use crate::region::{Region, RegionHandle, RegionView};
use crate::snapshot::ViewSource;

#[derive(Default)]
struct WorldIndex {
    regions: IndexMap<RegionCoord, Arc<RegionHandle>>,
    objects: IndexMap<ObjectId, Arc<ObjectHandle>>,
}

/// Changes waiting for the next tick boundary.
#[derive(Default)]
pub(crate) struct PendingChanges {
    pub regions: Vec<Region>,
    pub spawns: Vec<(ObjectId, Arc<ObjectHandle>)>,
    pub removals: Vec<ObjectId>,
}

impl PendingChanges {
    pub(crate) fn is_empty(&self) -> bool {
        self.regions.is_empty() && self.spawns.is_empty() && self.removals.is_empty()
    }
}

/// Registry of every live region and object.
pub struct World {
    stats: Arc<AcquireStats>,
    index: RwLock<WorldIndex>,
    pending: Mutex<PendingChanges>,
    next_object: AtomicU64,
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl World {
    /// An empty world.
    pub fn new() -> Self {
        Self {
            stats: Arc::new(AcquireStats::new()),
            index: RwLock::new(WorldIndex::default()),
            pending: Mutex::new(PendingChanges::default()),
            next_object: AtomicU64::new(1),
        }
    }

    /// Acquisition-wait counters shared by every handle in this world.
    pub fn acquire_stats(&self) -> &Arc<AcquireStats> {
        &self.stats
    }

    /// Queue a region to be loaded and assigned at the next boundary.
    ///
    /// Loading a coordinate that is already live is ignored.
    pub fn load_region(&self, region: Region) {
        lock_recover(&self.pending).regions.push(region);
    }

    /// Create an object. The handle is usable immediately; the object
    /// joins its region (and is simulated) from the next boundary on.
    pub fn spawn(&self, spec: ObjectSpec) -> Arc<ObjectHandle> {
        let id = ObjectId(self.next_object.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(SafeHandle::new(
            DynamicObject::new(id, spec),
            Arc::clone(&self.stats),
        ));
        lock_recover(&self.pending)
            .spawns
            .push((id, Arc::clone(&handle)));
        handle
    }

    /// Queue removal of an object; finalized at the next boundary.
    pub fn remove(&self, id: ObjectId) {
        lock_recover(&self.pending).removals.push(id);
    }

    /// The live region at `coord`.
    pub fn region(&self, coord: RegionCoord) -> Option<Arc<RegionHandle>> {
        self.read().regions.get(&coord).cloned()
    }

    /// The live object `id`.
    pub fn object(&self, id: ObjectId) -> Option<Arc<ObjectHandle>> {
        self.read().objects.get(&id).cloned()
    }

    /// Live regions, in load order.
    pub fn region_coords(&self) -> Vec<RegionCoord> {
        self.read().regions.keys().copied().collect()
    }

    /// Live object ids, in spawn order.
    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.read().objects.keys().copied().collect()
    }

    /// Number of live regions.
    pub fn region_count(&self) -> usize {
        self.read().regions.len()
    }

    /// Number of live objects.
    pub fn object_count(&self) -> usize {
        self.read().objects.len()
    }

    /// Number of changes waiting for the next boundary.
    pub fn pending_count(&self) -> usize {
        let p = lock_recover(&self.pending);
        p.regions.len() + p.spawns.len() + p.removals.len()
    }

    pub(crate) fn take_pending(&self) -> PendingChanges {
        std::mem::take(&mut *lock_recover(&self.pending))
    }

    pub(crate) fn insert_region(&self, coord: RegionCoord, handle: Arc<RegionHandle>) {
        self.write().regions.insert(coord, handle);
    }

    pub(crate) fn insert_object(&self, id: ObjectId, handle: Arc<ObjectHandle>) {
        self.write().objects.insert(id, handle);
    }

    pub(crate) fn remove_object(&self, id: ObjectId) -> Option<Arc<ObjectHandle>> {
        self.write().objects.shift_remove(&id)
    }

    fn read(&self) -> RwLockReadGuard<'_, WorldIndex> {
        self.index
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, WorldIndex> {
        self.index
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ViewSource for World {
    fn region_views(&self) -> Vec<Arc<RegionView>> {
        let handles: Vec<_> = self.read().regions.values().cloned().collect();
        handles.iter().map(|h| h.latest_view()).collect()
    }

    fn object_views(&self) -> Vec<Arc<ObjectView>> {
        let handles: Vec<_> = self.read().objects.values().cloned().collect();
        handles.iter().map(|h| h.latest_view()).collect()
    }
}
