//! Iso groups: LOD-aligned voxel aggregates and the table that indexes them.
//!
//! A group is the meshing unit. It owns a `CHUNK_DIM`³ sample buffer covering
//! `2^(max_lod - level)` chunks per axis, downsampled from the voxel store at
//! that stride, plus the mesh slots and dirty flags the mesher maintains for
//! it. Groups under the same `(level, x, z)` footprint column are chained
//! through `next`, newest first, like chunks in the voxel store.

use glam::IVec3;
use rustc_hash::FxHashMap;

use strata_gpu::ArenaSlot;
use strata_voxel::{CHUNK_DIM, CHUNK_VOLUME, Chunk, Voxel, linear_index};

use crate::mesher::MeshError;
use crate::vertex::TerrainVertex;

/// Stable index of a group in the table. Slots are reused after removal, so
/// an id is only meaningful while the group it named stays live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupId(pub u32);

impl GroupId {
    /// Sentinel for "no group".
    pub const INVALID: GroupId = GroupId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identity of a group: its coordinate on the level's group lattice plus the
/// quadtree level. The same spatial region at two levels is two groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupKey {
    /// Group coordinate, `chunk_coord >> (max_lod - level)` per axis.
    pub coord: IVec3,
    pub level: u8,
}

/// One uploaded sub-mesh: how many vertices it holds and where they live in
/// the arena. A mesh that extracted zero triangles holds no slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MeshSlot {
    pub vertex_count: u32,
    pub slot: Option<ArenaSlot>,
}

/// The meshing unit: a downsampled sample buffer plus per-group mesh state.
pub struct IsoGroup {
    key: GroupKey,
    samples: Box<[Voxel]>,
    pub(crate) regular: MeshSlot,
    pub(crate) transition: MeshSlot,
    pub(crate) staged_regular: Option<Vec<TerrainVertex>>,
    pub(crate) staged_transition: Option<Vec<TerrainVertex>>,
    pub(crate) needs_full_update: bool,
    pub(crate) needs_transition_update: bool,
    next: GroupId,
}

impl IsoGroup {
    pub(crate) fn new(key: GroupKey) -> Self {
        Self {
            key,
            samples: vec![Voxel::EMPTY; CHUNK_VOLUME].into_boxed_slice(),
            regular: MeshSlot::default(),
            transition: MeshSlot::default(),
            staged_regular: None,
            staged_transition: None,
            needs_full_update: false,
            needs_transition_update: false,
            next: GroupId::INVALID,
        }
    }

    #[inline]
    pub fn key(&self) -> GroupKey {
        self.key
    }

    /// The uploaded regular (interior) mesh.
    #[inline]
    pub fn regular(&self) -> MeshSlot {
        self.regular
    }

    /// The uploaded transition (seam) mesh.
    #[inline]
    pub fn transition(&self) -> MeshSlot {
        self.transition
    }

    /// The next group in this footprint column, if any.
    #[inline]
    pub fn next_in_column(&self) -> Option<GroupId> {
        if self.next.is_valid() {
            Some(self.next)
        } else {
            None
        }
    }

    /// Reads the sample at buffer-local `(x, y, z)`.
    #[inline]
    pub fn sample(&self, x: usize, y: usize, z: usize) -> Voxel {
        self.samples[linear_index(x, y, z)]
    }

    #[inline]
    pub(crate) fn set_sample(&mut self, x: usize, y: usize, z: usize, voxel: Voxel) {
        self.samples[linear_index(x, y, z)] = voxel;
    }

    /// Copies one chunk's voxels into this group's buffer at the group's
    /// stride. A level-`max_lod` group absorbs the chunk verbatim; coarser
    /// groups take every `2^(max_lod - level)`-th voxel, so one group can
    /// absorb up to `8^(max_lod - level)` chunks.
    pub fn absorb_chunk(&mut self, chunk: &Chunk, max_lod: u8) {
        debug_assert!(self.key.level <= max_lod);
        let stride_log2 = (max_lod - self.key.level) as usize;
        let per_chunk = CHUNK_DIM >> stride_log2;
        debug_assert!(per_chunk > 0, "stride exceeds chunk dimension");

        let local = chunk.coord() - self.key.coord * (1 << stride_log2);
        debug_assert!(
            local.min_element() >= 0 && local.max_element() < 1 << stride_log2,
            "chunk {:?} is outside group {:?}",
            chunk.coord(),
            self.key,
        );
        let base = local * per_chunk as i32;
        let (bx, by, bz) = (base.x as usize, base.y as usize, base.z as usize);

        for z in 0..per_chunk {
            for y in 0..per_chunk {
                for x in 0..per_chunk {
                    self.samples[linear_index(bx + x, by + y, bz + z)] = chunk.voxel(
                        x << stride_log2,
                        y << stride_log2,
                        z << stride_log2,
                    );
                }
            }
        }
    }
}

/// Bounded slab of iso groups with key lookup and per-column chains.
///
/// Removal returns slots to a free list, so the table never grows past the
/// capacity it was built with; running out is a recoverable
/// [`MeshError::GroupPoolExhausted`].
pub struct GroupTable {
    groups: Vec<Option<IsoGroup>>,
    free: Vec<GroupId>,
    by_key: FxHashMap<GroupKey, GroupId>,
    column_heads: FxHashMap<(u8, i32, i32), GroupId>,
    capacity: usize,
}

impl GroupTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            groups: Vec::new(),
            free: Vec::new(),
            by_key: FxHashMap::default(),
            column_heads: FxHashMap::default(),
            capacity,
        }
    }

    /// Number of live groups.
    pub fn len(&self) -> usize {
        self.groups.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn group(&self, id: GroupId) -> Option<&IsoGroup> {
        self.groups.get(id.index())?.as_ref()
    }

    #[inline]
    pub fn group_mut(&mut self, id: GroupId) -> Option<&mut IsoGroup> {
        self.groups.get_mut(id.index())?.as_mut()
    }

    pub fn id_by_key(&self, key: GroupKey) -> Option<GroupId> {
        self.by_key.get(&key).copied()
    }

    /// Returns the group with `key`, creating and column-linking it first if
    /// absent. Fails only when the table is full.
    pub fn get_or_create(&mut self, key: GroupKey) -> Result<GroupId, MeshError> {
        if let Some(&id) = self.by_key.get(&key) {
            return Ok(id);
        }

        let id = match self.free.pop() {
            Some(id) => id,
            None if self.groups.len() < self.capacity => {
                self.groups.push(None);
                GroupId(self.groups.len() as u32 - 1)
            }
            None => {
                return Err(MeshError::GroupPoolExhausted {
                    capacity: self.capacity,
                });
            }
        };

        let mut group = IsoGroup::new(key);
        let column = (key.level, key.coord.x, key.coord.z);
        if let Some(&head) = self.column_heads.get(&column) {
            group.next = head;
        }
        self.column_heads.insert(column, id);
        self.by_key.insert(key, id);
        self.groups[id.index()] = Some(group);
        tracing::trace!(?key, "created iso group");
        Ok(id)
    }

    /// Unlinks and removes a group, returning it so the caller can stage its
    /// arena slots for release.
    pub fn remove(&mut self, id: GroupId) -> Option<IsoGroup> {
        let group = self.groups.get_mut(id.index())?.take()?;
        let column = (group.key.level, group.key.coord.x, group.key.coord.z);

        let head = self.column_heads[&column];
        if head == id {
            if group.next.is_valid() {
                self.column_heads.insert(column, group.next);
            } else {
                self.column_heads.remove(&column);
            }
        } else {
            let mut cursor = head;
            loop {
                let Some(node) = self.groups[cursor.index()].as_mut() else {
                    break;
                };
                if node.next == id {
                    node.next = group.next;
                    break;
                }
                if !node.next.is_valid() {
                    break;
                }
                cursor = node.next;
            }
        }

        self.by_key.remove(&group.key);
        self.free.push(id);
        Some(group)
    }

    /// First group in the `(level, x, z)` column chain, if the column has any.
    pub fn column_head(&self, level: u8, x: i32, z: i32) -> Option<GroupId> {
        self.column_heads.get(&(level, x, z)).copied()
    }

    /// Collects the ids of every group in a footprint column.
    pub fn column_ids(&self, level: u8, x: i32, z: i32) -> Vec<GroupId> {
        let mut ids = Vec::new();
        let mut cursor = self.column_head(level, x, z);
        while let Some(id) = cursor {
            ids.push(id);
            cursor = self.group(id).and_then(IsoGroup::next_in_column);
        }
        ids
    }

    /// Iterates every live group with its id.
    pub fn iter(&self) -> impl Iterator<Item = (GroupId, &IsoGroup)> {
        self.groups
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| Some((GroupId(i as u32), slot.as_ref()?)))
    }

    /// Reads the sample at a lattice position of one level, resolving the
    /// owning group transparently. `None` if that group does not exist.
    ///
    /// Lattice positions count samples: group `g` owns `[g * 32, g * 32 + 32)`
    /// per axis, so adjacent groups do not share planes and a seam cell reads
    /// both sides through this lookup.
    pub fn sample_at(&self, level: u8, lattice: IVec3) -> Option<Voxel> {
        let dim = IVec3::splat(CHUNK_DIM as i32);
        let coord = lattice.div_euclid(dim);
        let local = lattice.rem_euclid(dim);
        let id = self.id_by_key(GroupKey { coord, level })?;
        let group = self.group(id)?;
        Some(group.sample(local.x as usize, local.y as usize, local.z as usize))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn key(x: i32, y: i32, z: i32, level: u8) -> GroupKey {
        GroupKey {
            coord: IVec3::new(x, y, z),
            level,
        }
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let mut table = GroupTable::new(8);
        let a = table.get_or_create(key(1, 0, 2, 3)).unwrap();
        let b = table.get_or_create(key(1, 0, 2, 3)).unwrap();
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_same_coord_different_level_is_a_different_group() {
        let mut table = GroupTable::new(8);
        let a = table.get_or_create(key(1, 0, 2, 3)).unwrap();
        let b = table.get_or_create(key(1, 0, 2, 2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_column_chain_links_newest_first() {
        let mut table = GroupTable::new(8);
        table.get_or_create(key(4, 0, 7, 2)).unwrap();
        table.get_or_create(key(4, 3, 7, 2)).unwrap();
        table.get_or_create(key(4, -1, 7, 2)).unwrap();
        // A different column must not join the chain.
        table.get_or_create(key(5, 0, 7, 2)).unwrap();

        let ys: Vec<i32> = table
            .column_ids(2, 4, 7)
            .iter()
            .map(|&id| table.group(id).unwrap().key().coord.y)
            .collect();
        assert_eq!(ys, vec![-1, 3, 0]);
        assert!(table.column_head(2, 9, 9).is_none());
    }

    #[test]
    fn test_remove_unlinks_any_chain_position() {
        let mut table = GroupTable::new(8);
        let bottom = table.get_or_create(key(0, 0, 0, 1)).unwrap();
        let middle = table.get_or_create(key(0, 1, 0, 1)).unwrap();
        let top = table.get_or_create(key(0, 2, 0, 1)).unwrap();

        table.remove(middle).unwrap();
        assert_eq!(table.column_ids(1, 0, 0), vec![top, bottom]);
        assert!(table.id_by_key(key(0, 1, 0, 1)).is_none());

        table.remove(top).unwrap();
        assert_eq!(table.column_ids(1, 0, 0), vec![bottom]);

        table.remove(bottom).unwrap();
        assert!(table.column_head(1, 0, 0).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_removed_slot_is_reused() {
        let mut table = GroupTable::new(8);
        let a = table.get_or_create(key(0, 0, 0, 0)).unwrap();
        table.remove(a).unwrap();
        let b = table.get_or_create(key(9, 9, 9, 0)).unwrap();
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_capacity_exhaustion_is_recoverable() {
        let mut table = GroupTable::new(2);
        let a = table.get_or_create(key(0, 0, 0, 0)).unwrap();
        table.get_or_create(key(1, 0, 0, 0)).unwrap();
        assert_eq!(
            table.get_or_create(key(2, 0, 0, 0)),
            Err(MeshError::GroupPoolExhausted { capacity: 2 })
        );

        table.remove(a).unwrap();
        assert!(table.get_or_create(key(2, 0, 0, 0)).is_ok());
    }

    #[test]
    fn test_sample_at_crosses_group_boundary() {
        let mut table = GroupTable::new(8);
        let solid = Voxel::new(255, Vec3::Y);
        let a = table.get_or_create(key(0, 0, 0, 2)).unwrap();
        let b = table.get_or_create(key(1, 0, 0, 2)).unwrap();
        table.group_mut(a).unwrap().set_sample(31, 0, 0, solid);
        table.group_mut(b).unwrap().set_sample(0, 0, 0, solid);

        assert_eq!(table.sample_at(2, IVec3::new(31, 0, 0)), Some(solid));
        assert_eq!(table.sample_at(2, IVec3::new(32, 0, 0)), Some(solid));
        assert_eq!(table.sample_at(2, IVec3::new(33, 0, 0)), Some(Voxel::EMPTY));
        // Same lattice point at another level is a different group.
        assert_eq!(table.sample_at(1, IVec3::new(31, 0, 0)), None);
        // Unloaded group, not empty space.
        assert_eq!(table.sample_at(2, IVec3::new(-1, 0, 0)), None);
    }

    #[test]
    fn test_sample_at_negative_lattice() {
        let mut table = GroupTable::new(8);
        let solid = Voxel::new(200, Vec3::Y);
        let id = table.get_or_create(key(0, -1, 0, 3)).unwrap();
        table.group_mut(id).unwrap().set_sample(0, 31, 0, solid);
        assert_eq!(table.sample_at(3, IVec3::new(0, -1, 0)), Some(solid));
    }

    #[test]
    fn test_absorb_chunk_at_full_resolution() {
        let mut chunk = Chunk::new(IVec3::new(2, 1, 0));
        let marker = Voxel::new(180, Vec3::X);
        chunk.set_voxel(5, 10, 20, marker);

        // At level == max_lod the group covers exactly one chunk.
        let mut group = IsoGroup::new(key(2, 1, 0, 3));
        group.absorb_chunk(&chunk, 3);
        assert_eq!(group.sample(5, 10, 20), marker);
        assert_eq!(group.sample(4, 10, 20), Voxel::EMPTY);
    }

    #[test]
    fn test_absorb_chunk_downsamples_at_stride() {
        let mut chunk = Chunk::new(IVec3::new(1, 0, 0));
        let marker = Voxel::new(220, Vec3::Y);
        let skipped = Voxel::new(140, Vec3::Y);
        chunk.set_voxel(2, 4, 6, marker);
        // Odd coordinates fall between stride-2 samples and must not appear.
        chunk.set_voxel(3, 4, 6, skipped);

        // max_lod 1, level 0: stride 2, 16 samples per chunk per axis, and
        // chunk (1, 0, 0) lands in the upper x half of group (0, 0, 0).
        let mut group = IsoGroup::new(key(0, 0, 0, 0));
        group.absorb_chunk(&chunk, 1);
        assert_eq!(group.sample(16 + 1, 2, 3), marker);
        for z in 0..CHUNK_DIM {
            for y in 0..CHUNK_DIM {
                for x in 0..CHUNK_DIM {
                    assert_ne!(group.sample(x, y, z), skipped);
                }
            }
        }
    }

    #[test]
    fn test_absorb_two_chunks_into_one_group() {
        let solid = Voxel::new(255, Vec3::Y);
        let mut low = Chunk::new(IVec3::new(0, 0, 0));
        let mut high = Chunk::new(IVec3::new(0, 1, 0));
        low.fill(solid);
        high.set_voxel(0, 30, 0, solid);

        let mut group = IsoGroup::new(key(0, 0, 0, 0));
        group.absorb_chunk(&low, 1);
        group.absorb_chunk(&high, 1);
        // Lower half solid throughout, upper half only at the one marker.
        assert_eq!(group.sample(0, 15, 0), solid);
        assert_eq!(group.sample(0, 16 + 15, 0), solid);
        assert_eq!(group.sample(1, 16 + 15, 0), Voxel::EMPTY);
    }
}
