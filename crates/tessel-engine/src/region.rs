//! Regions: fixed columns of world space holding terrain and objects.

use std::sync::Arc;

use indexmap::IndexMap;
use tessel_core::{ObjectId, PartitionId, RegionCoord, SimulationFault, TickId};

use crate::context::TickContext;
use crate::handle::{Publish, SafeHandle};
use crate::object::ObjectHandle;

/// Terrain columns along each horizontal axis of a region.
pub const REGION_COLUMNS: usize = 16;

/// Terrain columns per region.
pub const REGION_CELLS: usize = REGION_COLUMNS * REGION_COLUMNS;

/// Column height of freshly generated flat terrain.
pub const DEFAULT_GROUND: u16 = 64;

/// A region behind its safe handle.
pub type RegionHandle = SafeHandle<Region>;

/// A queued change to one terrain column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TerrainEdit {
    /// Column along X, `0..REGION_COLUMNS`.
    pub x: u8,
    /// Column along Z, `0..REGION_COLUMNS`.
    pub z: u8,
    /// New column height.
    pub height: u16,
}

/// One fixed cell of world space.
///
/// Terrain is shared copy-on-write with published views, so publishing
/// a view never copies the column data unless the region was edited
/// since the last publish.
#[derive(Debug)]
pub struct Region {
    coord: RegionCoord,
    terrain: Arc<Vec<u16>>,
    pending_edits: Vec<TerrainEdit>,
    objects: IndexMap<ObjectId, Arc<ObjectHandle>>,
    partition: Option<PartitionId>,
    ticks_simulated: u64,
    last_update: TickId,
}

impl Region {
    /// A region of flat terrain at [`DEFAULT_GROUND`].
    pub fn new(coord: RegionCoord) -> Self {
        Self::with_terrain(coord, [DEFAULT_GROUND; REGION_CELLS])
    }

    /// A region with explicit column heights, row-major by Z then X.
    pub fn with_terrain(coord: RegionCoord, heights: [u16; REGION_CELLS]) -> Self {
        Self {
            coord,
            terrain: Arc::new(heights.to_vec()),
            pending_edits: Vec::new(),
            objects: IndexMap::new(),
            partition: None,
            ticks_simulated: 0,
            last_update: TickId(0),
        }
    }

    /// Grid coordinate of this region.
    pub fn coord(&self) -> RegionCoord {
        self.coord
    }

    /// Column heights, row-major by Z then X.
    pub fn terrain(&self) -> &[u16] {
        &self.terrain
    }

    pub(crate) fn terrain_arc(&self) -> Arc<Vec<u16>> {
        Arc::clone(&self.terrain)
    }

    /// Height of column (`x`, `z`), or `None` outside the region.
    pub fn height_at(&self, x: usize, z: usize) -> Option<u16> {
        if x >= REGION_COLUMNS || z >= REGION_COLUMNS {
            return None;
        }
        self.terrain.get(z * REGION_COLUMNS + x).copied()
    }

    /// Queue a terrain change; applied on the region's next update.
    pub fn queue_edit(&mut self, edit: TerrainEdit) {
        self.pending_edits.push(edit);
    }

    /// Edits queued for the next update.
    pub fn pending_edits(&self) -> usize {
        self.pending_edits.len()
    }

    /// Ids of member objects, in insertion order.
    pub fn object_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.objects.keys().copied()
    }

    /// Number of member objects.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Whether `id` is a member.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Partition that owned this region at the last boundary.
    pub fn partition(&self) -> Option<PartitionId> {
        self.partition
    }

    /// Number of updates this region has run.
    pub fn ticks_simulated(&self) -> u64 {
        self.ticks_simulated
    }

    /// Tick of the most recent update.
    pub fn last_update(&self) -> TickId {
        self.last_update
    }

    pub(crate) fn set_partition(&mut self, partition: Option<PartitionId>) {
        self.partition = partition;
    }

    pub(crate) fn insert_object(&mut self, id: ObjectId, handle: Arc<ObjectHandle>) {
        self.objects.insert(id, handle);
    }

    pub(crate) fn remove_object(&mut self, id: ObjectId) -> Option<Arc<ObjectHandle>> {
        self.objects.shift_remove(&id)
    }

    pub(crate) fn object_handles(&self) -> Vec<(ObjectId, Arc<ObjectHandle>)> {
        self.objects
            .iter()
            .map(|(id, h)| (*id, Arc::clone(h)))
            .collect()
    }

    /// Apply queued terrain edits.
    ///
    /// Every valid edit is applied even if some are out of range; the
    /// out-of-range ones are dropped and reported as one fault.
    pub fn update(&mut self, ctx: &TickContext) -> Result<(), SimulationFault> {
        self.ticks_simulated += 1;
        self.last_update = ctx.tick;
        if self.pending_edits.is_empty() {
            return Ok(());
        }

        let mut rejected = 0usize;
        let terrain = Arc::make_mut(&mut self.terrain);
        for edit in self.pending_edits.drain(..) {
            let (x, z) = (usize::from(edit.x), usize::from(edit.z));
            if x >= REGION_COLUMNS || z >= REGION_COLUMNS {
                rejected += 1;
                continue;
            }
            terrain[z * REGION_COLUMNS + x] = edit.height;
        }

        if rejected > 0 {
            return Err(SimulationFault::Update {
                reason: format!(
                    "region {}: {rejected} terrain edit(s) out of range",
                    self.coord
                ),
            });
        }
        Ok(())
    }
}

/// Immutable published state of a region.
#[derive(Clone, Debug, PartialEq)]
pub struct RegionView {
    /// Grid coordinate.
    pub coord: RegionCoord,
    /// Tick at which this view was published.
    pub generation: TickId,
    /// Owning partition at publish time.
    pub partition: Option<PartitionId>,
    /// Column heights.
    pub terrain: Arc<Vec<u16>>,
    /// Member objects, in insertion order.
    pub objects: Vec<ObjectId>,
    /// Updates run so far.
    pub ticks_simulated: u64,
}

impl Publish for Region {
    type View = RegionView;

    fn view(&self, generation: TickId) -> RegionView {
        RegionView {
            coord: self.coord,
            generation,
            partition: self.partition,
            terrain: Arc::clone(&self.terrain),
            objects: self.objects.keys().copied().collect(),
            ticks_simulated: self.ticks_simulated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(n: u64) -> TickContext {
        TickContext::new(TickId(n), 0)
    }

    #[test]
    fn update_applies_edits_copy_on_write() {
        let mut region = Region::new(RegionCoord::new(0, 0));
        let published = region.view(TickId(0));
        region.queue_edit(TerrainEdit {
            x: 1,
            z: 2,
            height: 80,
        });
        region.update(&tick(1)).unwrap();

        assert_eq!(region.height_at(1, 2), Some(80));
        assert_eq!(region.pending_edits(), 0);
        // The earlier view keeps its own terrain.
        assert_eq!(published.terrain[2 * REGION_COLUMNS + 1], DEFAULT_GROUND);
        assert_eq!(region.ticks_simulated(), 1);
        assert_eq!(region.last_update(), TickId(1));
    }

    #[test]
    fn out_of_range_edit_is_reported_but_others_apply() {
        let mut region = Region::new(RegionCoord::new(2, 2));
        region.queue_edit(TerrainEdit {
            x: 16,
            z: 0,
            height: 1,
        });
        region.queue_edit(TerrainEdit {
            x: 0,
            z: 0,
            height: 2,
        });
        let err = region.update(&tick(1)).unwrap_err();
        assert!(matches!(err, SimulationFault::Update { .. }));
        assert_eq!(region.height_at(0, 0), Some(2));
        assert_eq!(region.pending_edits(), 0);
    }

    #[test]
    fn height_at_bounds() {
        let region = Region::new(RegionCoord::new(0, 0));
        assert_eq!(region.height_at(15, 15), Some(DEFAULT_GROUND));
        assert_eq!(region.height_at(16, 0), None);
    }

    #[test]
    fn view_lists_members_in_insertion_order() {
        use crate::handle::AcquireStats;
        use crate::object::{DynamicObject, ObjectSpec};
        use tessel_core::Vec3;

        let stats = Arc::new(AcquireStats::new());
        let mut region = Region::new(RegionCoord::new(0, 0));
        for id in [3u64, 1, 2] {
            let obj = DynamicObject::new(
                ObjectId(id),
                ObjectSpec::creature(Vec3::new(1.0, 64.0, 1.0), 10.0),
            );
            region.insert_object(
                ObjectId(id),
                Arc::new(SafeHandle::new(obj, Arc::clone(&stats))),
            );
        }
        region.remove_object(ObjectId(1));
        let view = region.view(TickId(4));
        assert_eq!(view.objects, vec![ObjectId(3), ObjectId(2)]);
        assert_eq!(view.generation, TickId(4));
    }
}
