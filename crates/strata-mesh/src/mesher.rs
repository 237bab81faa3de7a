//! Diff-driven meshing coordinator.
//!
//! [`TerrainMesher`] consumes the quadtree's Delete/Add diff and keeps the
//! iso group table in step with it: deleted footprints release their groups
//! (arena slots go to a pending free list), added footprints absorb chunk
//! data into fresh groups at the leaf resolution, and side neighbors that
//! the diff did not touch get their seam geometry rebuilt so transition
//! cells track the new resolution split. Extraction stages vertex data on
//! the CPU; [`TerrainMesher::sync_to_gpu`] moves staged meshes into the
//! arena afterwards, separately, so a render pass never observes a group
//! half updated.

use glam::{IVec2, IVec3, Vec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use strata_gpu::{ArenaError, ArenaSlot, MeshArena};
use strata_lod::{DiffEntry, DiffOp, LodQuadtree, NodeId, Side};
use strata_voxel::{VoxelStore, CHUNK_DIM};

use crate::extract::extract_regular;
use crate::group::{GroupId, GroupKey, GroupTable, MeshSlot};
use crate::transition::extract_transition;
use crate::vertex::TerrainVertex;

/// Errors surfaced by the meshing pipeline. Every variant is recoverable:
/// unfinished work keeps its dirty flags and is retried on a later cycle
/// once the caller has made room.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MeshError {
    /// The iso group pool is out of entries. Callers should back off on
    /// refinement (move the focal point out, or raise the pool size)
    /// instead of treating this as fatal.
    #[error("iso group pool exhausted ({capacity} groups)")]
    GroupPoolExhausted { capacity: usize },
    /// The GPU arena could not hold a staged mesh.
    #[error("gpu mesh arena: {0}")]
    Gpu(#[from] ArenaError),
}

/// Construction-time knobs for the meshing pipeline.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MesherConfig {
    /// Deepest quadtree level. Must match the tree the mesher is fed.
    pub max_lod: u8,
    /// Iso group pool capacity.
    pub max_groups: usize,
    /// GPU vertex arena size in blocks.
    pub arena_blocks: u32,
    /// Threads in the meshing task pool.
    pub worker_threads: usize,
}

impl Default for MesherConfig {
    fn default() -> Self {
        Self {
            max_lod: 5,
            max_groups: 4096,
            arena_blocks: 8192,
            worker_threads: std::thread::available_parallelism().map_or(2, |n| n.get().min(2)),
        }
    }
}

/// Renderer-facing copy of one live group's uploaded meshes.
#[derive(Clone, Copy, Debug)]
pub struct IsoGroupSnapshot {
    pub coord: IVec3,
    pub level: u8,
    pub regular: MeshSlot,
    pub transition: MeshSlot,
}

/// World position to the footprint cell containing it.
pub fn world_to_footprint(position: Vec3) -> IVec2 {
    IVec2::new(
        (position.x / CHUNK_DIM as f32).floor() as i32,
        (position.z / CHUNK_DIM as f32).floor() as i32,
    )
}

/// World-space origin of a footprint cell.
pub fn footprint_to_world(cell: IVec2) -> Vec3 {
    Vec3::new(
        (cell.x * CHUNK_DIM as i32) as f32,
        0.0,
        (cell.y * CHUNK_DIM as i32) as f32,
    )
}

/// Keeps the iso group table synchronized with quadtree refinement and the
/// GPU arena synchronized with the table.
pub struct TerrainMesher {
    config: MesherConfig,
    groups: GroupTable,
    /// Slots of deleted groups, released at the start of the next sync.
    freed_slots: Vec<ArenaSlot>,
    /// Groups with staged vertex data awaiting upload.
    touched: Vec<GroupId>,
}

impl TerrainMesher {
    pub fn new(config: MesherConfig) -> Self {
        debug_assert!(
            (config.max_lod as u32) <= CHUNK_DIM.trailing_zeros(),
            "lattice stride would exceed the chunk dimension"
        );
        Self {
            config,
            groups: GroupTable::new(config.max_groups),
            freed_slots: Vec::new(),
            touched: Vec::new(),
        }
    }

    pub fn config(&self) -> &MesherConfig {
        &self.config
    }

    pub fn groups(&self) -> &GroupTable {
        &self.groups
    }

    /// True when staged meshes or freed slots are waiting on a
    /// [`TerrainMesher::sync_to_gpu`] call.
    pub fn has_pending_uploads(&self) -> bool {
        !self.touched.is_empty() || !self.freed_slots.is_empty()
    }

    /// Applies one refinement diff: releases groups under deleted nodes,
    /// builds groups for added ones from the store, marks untouched side
    /// neighbors for seam rebuild, then re-extracts every dirty group.
    ///
    /// On [`MeshError::GroupPoolExhausted`] the table keeps whatever was
    /// built so far with its dirty flags intact; a later diff (typically
    /// one that coarsens the tree) completes the work.
    pub fn apply_diff(
        &mut self,
        store: &VoxelStore,
        tree: &LodQuadtree,
        diff: &[DiffEntry],
    ) -> Result<(), MeshError> {
        debug_assert_eq!(tree.max_lod(), self.config.max_lod);

        for entry in diff {
            if entry.op == DiffOp::Delete {
                self.release_node_groups(tree, entry.node);
            }
        }
        for entry in diff {
            if entry.op == DiffOp::Add {
                self.create_node_groups(store, tree, entry.node)?;
            }
        }
        for entry in diff {
            if entry.op == DiffOp::Add {
                self.mark_seam_neighbors(tree, entry.node);
            }
        }

        let extracted = self.extract_dirty_groups();
        tracing::debug!(
            entries = diff.len(),
            live_groups = self.groups.len(),
            extracted,
            "applied refinement diff"
        );
        Ok(())
    }

    /// Drops every group whose footprint lies under `node`, at the node's
    /// own level and every deeper one. Their arena slots join the pending
    /// free list.
    fn release_node_groups(&mut self, tree: &LodQuadtree, node: NodeId) {
        let Some(info) = tree.node_info(node) else {
            return;
        };
        for level in info.level..=self.config.max_lod {
            // Group footprints at `level` span 2^stride_log2 cells; the
            // node's footprint is aligned to a multiple of that.
            let stride_log2 = self.config.max_lod - level;
            let base_x = info.footprint.x >> stride_log2;
            let base_z = info.footprint.y >> stride_log2;
            let columns = 1i32 << (level - info.level);
            for dz in 0..columns {
                for dx in 0..columns {
                    for id in self.groups.column_ids(level, base_x + dx, base_z + dz) {
                        self.release_group(id);
                    }
                }
            }
        }
    }

    fn release_group(&mut self, id: GroupId) {
        let Some(group) = self.groups.remove(id) else {
            return;
        };
        if let Some(slot) = group.regular().slot {
            self.freed_slots.push(slot);
        }
        if let Some(slot) = group.transition().slot {
            self.freed_slots.push(slot);
        }
    }

    /// Builds groups for every loaded chunk under `node`, each at the
    /// resolution of the deepest leaf covering its column.
    fn create_node_groups(
        &mut self,
        store: &VoxelStore,
        tree: &LodQuadtree,
        node: NodeId,
    ) -> Result<(), MeshError> {
        let max_lod = self.config.max_lod;
        for leaf in tree.deepest_nodes_under(node) {
            let Some(info) = tree.node_info(leaf) else {
                continue;
            };
            let stride_log2 = max_lod - info.level;
            for dz in 0..info.span as i32 {
                for dx in 0..info.span as i32 {
                    let column = info.footprint + IVec2::new(dx, dz);
                    for chunk in store.column_chunks(column.x, column.y) {
                        let key = GroupKey {
                            coord: chunk.coord().div_euclid(IVec3::splat(1 << stride_log2)),
                            level: info.level,
                        };
                        let id = self.groups.get_or_create(key)?;
                        if let Some(group) = self.groups.group_mut(id) {
                            group.absorb_chunk(chunk, max_lod);
                            group.needs_full_update = true;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Walks the one-cell strip outside each side of the added node's
    /// footprint and flags every group of each bordering leaf the diff did
    /// not already touch. Their transition meshes face a changed neighbor
    /// and must be cut again even though their volumes are intact.
    fn mark_seam_neighbors(&mut self, tree: &LodQuadtree, node: NodeId) {
        let Some(info) = tree.node_info(node) else {
            return;
        };
        let span = info.span as i32;
        for side in Side::ALL {
            let offset = side.offset();
            let base = info.footprint
                + IVec2::new(
                    if offset.x > 0 { span } else { offset.x },
                    if offset.y > 0 { span } else { offset.y },
                );
            for step in 0..span {
                let cell = if offset.x != 0 {
                    base + IVec2::new(0, step)
                } else {
                    base + IVec2::new(step, 0)
                };
                let Some(leaf) = tree.node_at(cell) else {
                    continue;
                };
                let Some(leaf_info) = tree.node_info(leaf) else {
                    continue;
                };
                if leaf_info.was_diffed {
                    // Rebuilt by its own Add entry this cycle.
                    continue;
                }
                let stride_log2 = self.config.max_lod - leaf_info.level;
                let group_x = leaf_info.footprint.x >> stride_log2;
                let group_z = leaf_info.footprint.y >> stride_log2;
                for id in self.groups.column_ids(leaf_info.level, group_x, group_z) {
                    if let Some(group) = self.groups.group_mut(id) {
                        group.needs_transition_update = true;
                    }
                }
            }
        }
    }

    /// Re-extracts every group with a dirty flag, staging the results.
    /// Scans the whole table rather than a per-cycle list so groups left
    /// dirty by an earlier failed cycle heal here.
    fn extract_dirty_groups(&mut self) -> usize {
        let max_lod = self.config.max_lod;
        let dirty: Vec<GroupId> = self
            .groups
            .iter()
            .filter(|(_, group)| group.needs_full_update || group.needs_transition_update)
            .map(|(id, _)| id)
            .collect();

        for &id in &dirty {
            let Some(group) = self.groups.group(id) else {
                continue;
            };
            let key = group.key();
            let full = group.needs_full_update;

            let staged_regular = full.then(|| {
                let mut vertices = Vec::new();
                extract_regular(group, max_lod, &mut vertices);
                vertices
            });
            // A full rebuild re-cuts the seams too; samples changed under
            // both meshes.
            let mut staged_transition = Vec::new();
            extract_transition(&self.groups, key, max_lod, &mut staged_transition);

            let Some(group) = self.groups.group_mut(id) else {
                continue;
            };
            if let Some(vertices) = staged_regular {
                group.staged_regular = Some(vertices);
            }
            group.staged_transition = Some(staged_transition);
            group.needs_full_update = false;
            group.needs_transition_update = false;
            self.touched.push(id);
        }
        dirty.len()
    }

    /// Releases pending freed slots, then uploads every staged mesh into
    /// the arena.
    ///
    /// On arena exhaustion the staged data goes back onto its group and the
    /// remaining uploads stay queued; the call reports the error and can be
    /// retried after the caller frees arena space (usually by coarsening
    /// the tree and syncing again).
    pub fn sync_to_gpu(
        &mut self,
        arena: &mut MeshArena,
        queue: &wgpu::Queue,
    ) -> Result<(), MeshError> {
        for slot in self.freed_slots.drain(..) {
            arena.free(slot);
        }

        let mut index = 0;
        while index < self.touched.len() {
            let id = self.touched[index];
            if let Err(error) = self.upload_group(arena, queue, id) {
                // Drop the processed prefix, keep the failed entry and the
                // tail for the retry.
                self.touched.drain(..index);
                return Err(error);
            }
            index += 1;
        }
        self.touched.clear();
        Ok(())
    }

    fn upload_group(
        &mut self,
        arena: &mut MeshArena,
        queue: &wgpu::Queue,
        id: GroupId,
    ) -> Result<(), MeshError> {
        // The group may have been deleted between staging and sync.
        let Some(group) = self.groups.group_mut(id) else {
            return Ok(());
        };

        if let Some(vertices) = group.staged_regular.take() {
            if let Some(slot) = group.regular.slot.take() {
                arena.free(slot);
            }
            match upload_mesh(arena, queue, &vertices) {
                Ok(mesh) => group.regular = mesh,
                Err(error) => {
                    group.regular = MeshSlot::default();
                    group.staged_regular = Some(vertices);
                    return Err(error.into());
                }
            }
        }
        if let Some(vertices) = group.staged_transition.take() {
            if let Some(slot) = group.transition.slot.take() {
                arena.free(slot);
            }
            match upload_mesh(arena, queue, &vertices) {
                Ok(mesh) => group.transition = mesh,
                Err(error) => {
                    group.transition = MeshSlot::default();
                    group.staged_transition = Some(vertices);
                    return Err(error.into());
                }
            }
        }
        Ok(())
    }

    /// Copies the renderer-facing state of every live group holding at
    /// least one uploaded mesh into `out`.
    pub fn snapshots(&self, out: &mut Vec<IsoGroupSnapshot>) {
        out.clear();
        for (_, group) in self.groups.iter() {
            if group.regular.vertex_count == 0 && group.transition.vertex_count == 0 {
                continue;
            }
            let key = group.key();
            out.push(IsoGroupSnapshot {
                coord: key.coord,
                level: key.level,
                regular: group.regular,
                transition: group.transition,
            });
        }
    }
}

fn upload_mesh(
    arena: &mut MeshArena,
    queue: &wgpu::Queue,
    vertices: &[TerrainVertex],
) -> Result<MeshSlot, ArenaError> {
    if vertices.is_empty() {
        return Ok(MeshSlot::default());
    }
    let bytes: &[u8] = bytemuck::cast_slice(vertices);
    let slot = arena.allocate(bytes.len() as u64)?;
    arena.write(queue, slot, bytes);
    Ok(MeshSlot {
        vertex_count: vertices.len() as u32,
        slot: Some(slot),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use strata_lod::LodSettings;
    use strata_voxel::Voxel;

    fn test_tree(max_lod: u8) -> LodQuadtree {
        LodQuadtree::new(LodSettings {
            max_lod,
            subdivide_factor: 1.0,
            cell_world_size: CHUNK_DIM as f32,
        })
    }

    fn test_mesher(max_lod: u8, max_groups: usize) -> TerrainMesher {
        TerrainMesher::new(MesherConfig {
            max_lod,
            max_groups,
            ..MesherConfig::default()
        })
    }

    /// A slab of solid ground under world height 16 in every chunk column
    /// of a `span` x `span` grid.
    fn ground_store(span: i32) -> VoxelStore {
        let mut store = VoxelStore::new();
        for cz in 0..span {
            for cx in 0..span {
                let chunk = store.chunk_mut_or_insert(IVec3::new(cx, 0, cz));
                for z in 0..CHUNK_DIM {
                    for y in 0..16 {
                        for x in 0..CHUNK_DIM {
                            chunk.set_voxel(x, y, z, Voxel::new(255, Vec3::Y));
                        }
                    }
                }
            }
        }
        store
    }

    fn apply_current_diff(mesher: &mut TerrainMesher, store: &VoxelStore, tree: &LodQuadtree) {
        mesher
            .apply_diff(store, tree, tree.diff())
            .unwrap_or_else(|error| panic!("diff failed: {error}"));
    }

    #[test]
    fn test_empty_store_builds_no_groups() {
        let store = VoxelStore::new();
        let mut tree = test_tree(2);
        tree.set_focal_point(Vec3::ZERO).unwrap();

        let mut mesher = test_mesher(2, 64);
        apply_current_diff(&mut mesher, &store, &tree);

        assert!(mesher.groups().is_empty());
        assert!(!mesher.has_pending_uploads());
        let mut snapshots = Vec::new();
        mesher.snapshots(&mut snapshots);
        assert!(snapshots.is_empty());
    }

    #[test]
    fn test_apply_diff_builds_groups_at_leaf_levels() {
        // Focal at the origin subdivides the (0,0) quadrant to level 2 and
        // leaves the other three quadrants at level 1.
        let store = ground_store(4);
        let mut tree = test_tree(2);
        tree.set_focal_point(Vec3::ZERO).unwrap();

        let mut mesher = test_mesher(2, 64);
        apply_current_diff(&mut mesher, &store, &tree);

        assert_eq!(mesher.groups().len(), 7);
        let fine = mesher
            .groups()
            .id_by_key(GroupKey {
                coord: IVec3::ZERO,
                level: 2,
            })
            .and_then(|id| mesher.groups().group(id))
            .unwrap_or_else(|| panic!("missing fine group at the focal corner"));
        // Ground crossing is staged and waiting for upload.
        assert!(fine.staged_regular.as_ref().is_some_and(|v| !v.is_empty()));
        assert!(fine.staged_transition.is_some());
        assert!(mesher.has_pending_uploads());

        // The far quadrant meshes at level 1: its four chunk columns share
        // one group.
        let coarse = mesher.groups().id_by_key(GroupKey {
            coord: IVec3::new(1, 0, 1),
            level: 1,
        });
        assert!(coarse.is_some());

        // Nothing has reached the GPU yet, so the renderer sees nothing.
        let mut snapshots = Vec::new();
        mesher.snapshots(&mut snapshots);
        assert!(snapshots.is_empty());
    }

    #[test]
    fn test_unchanged_focal_applies_empty_diff() {
        let store = ground_store(4);
        let mut tree = test_tree(2);
        tree.set_focal_point(Vec3::ZERO).unwrap();

        let mut mesher = test_mesher(2, 64);
        apply_current_diff(&mut mesher, &store, &tree);
        let before = mesher.groups().len();

        tree.set_focal_point(Vec3::ZERO).unwrap();
        assert!(tree.diff().is_empty());
        apply_current_diff(&mut mesher, &store, &tree);
        assert_eq!(mesher.groups().len(), before);
    }

    #[test]
    fn test_focal_move_releases_and_rebuilds_groups() {
        let store = ground_store(4);
        let mut tree = test_tree(2);
        tree.set_focal_point(Vec3::ZERO).unwrap();

        let mut mesher = test_mesher(2, 64);
        apply_current_diff(&mut mesher, &store, &tree);
        assert_eq!(mesher.groups().len(), 7);

        // Far enough that the root collapses to a single leaf.
        tree.set_focal_point(Vec3::new(1.0e6, 0.0, 1.0e6)).unwrap();
        apply_current_diff(&mut mesher, &store, &tree);

        assert_eq!(mesher.groups().len(), 1);
        let (_, root_group) = mesher
            .groups()
            .iter()
            .next()
            .unwrap_or_else(|| panic!("root group missing"));
        assert_eq!(root_group.key().level, 0);
        assert_eq!(root_group.key().coord, IVec3::ZERO);
    }

    #[test]
    fn test_seam_at_grown_lod_boundary_is_walled_shut() {
        // Ground on both sides of world x = 128. The focal point drives
        // cell (3,0) to level 3 while distance alone would leave cells
        // 4..6 at level 1; refinement grows them to level 2, so the fine
        // side can build a one-level transition across the boundary.
        let mut store = VoxelStore::new();
        for cx in 3..6 {
            let chunk = store.chunk_mut_or_insert(IVec3::new(cx, 0, 0));
            for z in 0..CHUNK_DIM {
                for y in 0..8 {
                    for x in 0..CHUNK_DIM {
                        chunk.set_voxel(x, y, z, Voxel::new(255, Vec3::Y));
                    }
                }
            }
        }

        let mut tree = test_tree(3);
        tree.set_focal_point(Vec3::new(40.0, 0.0, 16.0)).unwrap();
        let mut mesher = test_mesher(3, 64);
        apply_current_diff(&mut mesher, &store, &tree);

        let coarse = mesher.groups().id_by_key(GroupKey {
            coord: IVec3::new(2, 0, 0),
            level: 2,
        });
        assert!(coarse.is_some(), "coarse side not meshed at the grown level");

        // The fine side owns the seam: transition walls bridge from its
        // boundary plane to the coarse samples one fine unit beyond.
        let fine = mesher
            .groups()
            .id_by_key(GroupKey {
                coord: IVec3::new(3, 0, 0),
                level: 3,
            })
            .and_then(|id| mesher.groups().group(id))
            .unwrap_or_else(|| panic!("missing fine group at the boundary"));
        let seam = fine
            .staged_transition
            .as_ref()
            .unwrap_or_else(|| panic!("fine group staged no seam mesh"));
        assert!(!seam.is_empty(), "no geometry walls the lod boundary");
        for v in seam {
            assert!(
                v.position[0] >= 127.0 - 1e-5 && v.position[0] <= 128.0 + 1e-5,
                "seam vertex strayed from the boundary band: {:?}",
                v.position
            );
        }
    }

    #[test]
    fn test_add_marks_untouched_side_neighbors() {
        let store = ground_store(4);
        let mut tree = test_tree(2);
        tree.set_focal_point(Vec3::ZERO).unwrap();

        let mut mesher = test_mesher(2, 64);
        apply_current_diff(&mut mesher, &store, &tree);

        // Pretend a sync consumed all staged data.
        let ids: Vec<GroupId> = mesher.groups.iter().map(|(id, _)| id).collect();
        for id in ids {
            if let Some(group) = mesher.groups.group_mut(id) {
                group.staged_regular = None;
                group.staged_transition = None;
            }
        }
        mesher.touched.clear();

        // This focal point subdivides the (2,0) level-1 leaf and nothing
        // else; its west and south neighbors keep their volumes.
        tree.set_focal_point(Vec3::new(72.0, 0.0, 24.0)).unwrap();
        assert!(!tree.diff().is_empty());
        apply_current_diff(&mut mesher, &store, &tree);

        let seam_only = |coord: IVec3, level: u8| {
            let group = mesher
                .groups()
                .id_by_key(GroupKey { coord, level })
                .and_then(|id| mesher.groups().group(id))
                .unwrap_or_else(|| panic!("missing group at {coord:?} level {level}"));
            group.staged_regular.is_none() && group.staged_transition.is_some()
        };

        // Bordering leaves west and south of the subdivided footprint were
        // re-cut without a full rebuild.
        assert!(seam_only(IVec3::new(1, 0, 0), 2));
        assert!(seam_only(IVec3::new(1, 0, 1), 2));
        assert!(seam_only(IVec3::new(1, 0, 1), 1));

        // A leaf not bordering the change stayed clean.
        let far = mesher
            .groups()
            .id_by_key(GroupKey {
                coord: IVec3::ZERO,
                level: 2,
            })
            .and_then(|id| mesher.groups().group(id))
            .unwrap_or_else(|| panic!("missing far group"));
        assert!(far.staged_regular.is_none());
        assert!(far.staged_transition.is_none());

        // The new fine groups under the subdivided leaf got full rebuilds.
        let new_fine = mesher
            .groups()
            .id_by_key(GroupKey {
                coord: IVec3::new(2, 0, 0),
                level: 2,
            })
            .and_then(|id| mesher.groups().group(id))
            .unwrap_or_else(|| panic!("missing subdivided group"));
        assert!(new_fine.staged_regular.is_some());
        assert!(new_fine.staged_transition.is_some());
    }

    #[test]
    fn test_group_pool_exhaustion_is_recoverable() {
        let store = ground_store(4);
        let mut tree = test_tree(2);
        tree.set_focal_point(Vec3::ZERO).unwrap();

        // The scene wants 7 groups; the pool holds 3.
        let mut mesher = test_mesher(2, 3);
        let result = mesher.apply_diff(&store, &tree, tree.diff());
        assert_eq!(result, Err(MeshError::GroupPoolExhausted { capacity: 3 }));
        assert!(mesher.groups().len() <= 3);

        // Coarsening the tree shrinks the working set below the cap and the
        // next cycle completes.
        tree.set_focal_point(Vec3::new(1.0e6, 0.0, 1.0e6)).unwrap();
        apply_current_diff(&mut mesher, &store, &tree);
        assert_eq!(mesher.groups().len(), 1);
    }

    #[test]
    fn test_world_footprint_mapping() {
        assert_eq!(
            world_to_footprint(Vec3::new(33.0, 5.0, -1.0)),
            IVec2::new(1, -1)
        );
        assert_eq!(world_to_footprint(Vec3::ZERO), IVec2::ZERO);
        assert_eq!(
            footprint_to_world(IVec2::new(1, -1)),
            Vec3::new(32.0, 0.0, -32.0)
        );
        for cell in [IVec2::new(0, 0), IVec2::new(3, -2), IVec2::new(-7, 5)] {
            assert_eq!(world_to_footprint(footprint_to_world(cell)), cell);
        }
    }

    // GPU-dependent below here; skipped where no adapter exists.

    fn test_device() -> Option<(wgpu::Device, wgpu::Queue)> {
        pollster::block_on(async {
            let instance = wgpu::Instance::default();
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions::default())
                .await
                .ok()?;
            adapter
                .request_device(&wgpu::DeviceDescriptor::default())
                .await
                .ok()
        })
    }

    #[test]
    fn test_sync_uploads_and_recycles_arena_slots() {
        let Some((device, queue)) = test_device() else {
            return;
        };
        let mut arena = MeshArena::new(&device, 512, wgpu::BufferUsages::VERTEX);

        let store = ground_store(2);
        let mut tree = test_tree(1);
        tree.set_focal_point(Vec3::ZERO).unwrap();

        let mut mesher = test_mesher(1, 16);
        apply_current_diff(&mut mesher, &store, &tree);
        mesher
            .sync_to_gpu(&mut arena, &queue)
            .unwrap_or_else(|error| panic!("sync failed: {error}"));
        assert!(!mesher.has_pending_uploads());

        // Uploaded block usage matches what the snapshots hold.
        let mut snapshots = Vec::new();
        mesher.snapshots(&mut snapshots);
        assert_eq!(snapshots.len(), 4);
        let held: u64 = snapshots
            .iter()
            .flat_map(|s| [s.regular.slot, s.transition.slot])
            .flatten()
            .map(|slot| slot.size / strata_gpu::BLOCK_SIZE)
            .sum();
        assert!(held > 0);
        assert_eq!(arena.used_blocks() as u64, held);
        let used_fine = arena.used_blocks();

        // Collapse to one coarse group; its mesh replaces all four.
        tree.set_focal_point(Vec3::new(1.0e6, 0.0, 1.0e6)).unwrap();
        apply_current_diff(&mut mesher, &store, &tree);
        mesher
            .sync_to_gpu(&mut arena, &queue)
            .unwrap_or_else(|error| panic!("sync failed: {error}"));

        mesher.snapshots(&mut snapshots);
        assert_eq!(snapshots.len(), 1);
        let root = &snapshots[0];
        assert!(root.regular.slot.is_some());
        assert!(root.regular.vertex_count > 0);
        // A lone group has no neighbors, so no seam mesh.
        assert!(root.transition.slot.is_none());
        assert!(arena.used_blocks() < used_fine);
        assert_eq!(
            arena.used_blocks() as u64,
            root.regular.slot.map_or(0, |slot| slot.size / strata_gpu::BLOCK_SIZE)
        );
    }

    #[test]
    fn test_sync_survives_arena_exhaustion() {
        let Some((device, queue)) = test_device() else {
            return;
        };
        // Holds the first ground mesh but not the second.
        let mut arena = MeshArena::new(&device, 40, wgpu::BufferUsages::VERTEX);

        let store = ground_store(2);
        let mut tree = test_tree(1);
        tree.set_focal_point(Vec3::ZERO).unwrap();

        let mut mesher = test_mesher(1, 16);
        apply_current_diff(&mut mesher, &store, &tree);

        let result = mesher.sync_to_gpu(&mut arena, &queue);
        assert!(matches!(result, Err(MeshError::Gpu(_))));
        // The completed prefix stays uploaded; the failed group keeps its
        // staged data for a retry.
        assert!(arena.used_blocks() > 0);
        assert!(mesher.has_pending_uploads());

        // Walking away coarsens the tree, which frees the uploaded slots
        // and shrinks the staged set until the same arena fits it.
        tree.set_focal_point(Vec3::new(1.0e6, 0.0, 1.0e6)).unwrap();
        apply_current_diff(&mut mesher, &store, &tree);
        mesher
            .sync_to_gpu(&mut arena, &queue)
            .unwrap_or_else(|error| panic!("retry failed: {error}"));
        assert!(!mesher.has_pending_uploads());

        let mut snapshots = Vec::new();
        mesher.snapshots(&mut snapshots);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(
            arena.used_blocks() as u64,
            snapshots[0]
                .regular
                .slot
                .map_or(0, |slot| slot.size / strata_gpu::BLOCK_SIZE)
        );
    }
}
