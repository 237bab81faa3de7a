//! Focal-driven refinement: re-evaluates subdivision against a camera
//! position and records the structural changes as an incremental diff.
//! Edge-adjacent leaves are kept within one level of each other.

use glam::{IVec2, Vec2, Vec3};

use crate::quadtree::{LodError, LodQuadtree, NodeId, ROOT, Side};

/// What happened to a node during refinement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffOp {
    /// The node's footprint lost its previous mesh groups.
    Delete,
    /// The node's footprint needs groups rebuilt from its current leaves.
    Add,
}

/// One entry of the refinement diff. Entries come in Delete/Add pairs per
/// changed node, Delete first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiffEntry {
    pub op: DiffOp,
    pub node: NodeId,
}

impl LodQuadtree {
    /// Re-evaluates subdivision for a new focal point.
    ///
    /// Clears the previous diff and `was_diffed` flags, then walks the live
    /// tree. A node wants children iff it is above `max_lod` and the squared
    /// XZ distance from its footprint center to the focal point is below the
    /// squared cutoff (`subdivide_factor` × node world size). Each topmost
    /// node whose state flips gets one Delete/Add pair and its whole live
    /// subtree is marked `was_diffed`; deeper flips inside a changed subtree
    /// restructure silently under the ancestor's pair.
    ///
    /// Edge-adjacent leaves never end up more than one level apart, the
    /// widest gap a transition mesh can span. A trailing pass grows the
    /// coarse side of any bigger jump (growth outside a diffed subtree
    /// emits its own pair), and a collapse that would open such a jump is
    /// held back until its neighborhood coarsens.
    ///
    /// On pool exhaustion the walk keeps going without subdividing further
    /// and reports [`LodError::NodePoolExhausted`] at the end; the tree and
    /// the emitted diff stay consistent, and the next call retries.
    pub fn set_focal_point(&mut self, focal: Vec3) -> Result<(), LodError> {
        self.diff.clear();
        while let Some(id) = self.diffed_nodes.pop() {
            // Collapsed nodes from earlier cycles may already be dead.
            if let Some(node) = self.nodes.get_mut(id.index()) {
                node.was_diffed = false;
            }
        }

        let focal_xz = Vec2::new(focal.x, focal.z);
        let mut exhausted = false;
        self.refine(ROOT, focal_xz, false, &mut exhausted);
        self.balance(focal_xz, &mut exhausted);

        if exhausted {
            Err(LodError::NodePoolExhausted {
                capacity: self.nodes.len(),
            })
        } else {
            Ok(())
        }
    }

    fn refine(&mut self, id: NodeId, focal_xz: Vec2, in_changed_subtree: bool, exhausted: &mut bool) {
        let wants_children = self.wants_children(id, focal_xz);
        let has_children = self.node(id).has_children();

        let mut changed = false;
        if wants_children != has_children {
            if wants_children {
                match self.subdivide(id) {
                    Ok(()) => changed = true,
                    // Leave the node a leaf; a later cycle retries.
                    Err(LodError::NodePoolExhausted { .. }) => *exhausted = true,
                }
            } else if self.collapse_keeps_balance(id) {
                self.collapse_children(id);
                changed = true;
            }
            // A held-back collapse keeps its children; the walk descends
            // into them and trims whatever depth the neighborhood allows.
        }

        let marked = changed || in_changed_subtree;
        if marked {
            self.node_mut(id).was_diffed = true;
            self.diffed_nodes.push(id);
        }
        if changed && !in_changed_subtree {
            self.diff.push(DiffEntry {
                op: DiffOp::Delete,
                node: id,
            });
            self.diff.push(DiffEntry {
                op: DiffOp::Add,
                node: id,
            });
        }

        let first_child = self.node(id).first_child;
        if first_child.is_valid() {
            for i in 0..4 {
                self.refine(NodeId(first_child.0 + i), focal_xz, marked, exhausted);
            }
        }
    }

    /// The subdivision predicate: squared distance from the node's footprint
    /// center against the squared cutoff for its level.
    fn wants_children(&self, id: NodeId, focal_xz: Vec2) -> bool {
        let node = self.node(id);
        if node.level >= self.settings.max_lod {
            return false;
        }
        let span_cells = self.span_at_level(node.level) as f32;
        let world_size = span_cells * self.settings.cell_world_size;
        let center = (Vec2::new(node.footprint.x as f32, node.footprint.y as f32)
            + Vec2::splat(span_cells * 0.5))
            * self.settings.cell_world_size;
        let cutoff = self.settings.subdivide_factor * world_size;
        focal_xz.distance_squared(center) < cutoff * cutoff
    }

    /// Grows leaves until no leaf borders one more than a single level
    /// deeper. With a small `subdivide_factor` the distance bands narrow
    /// enough that a max-lod leaf can touch a much coarser one; growth
    /// ripples outward until a sweep finds every edge within tolerance.
    ///
    /// One corner lookup per side suffices: a coarser neighbor's footprint
    /// is aligned to at least this leaf's span, so it covers the whole
    /// strip beyond any corner cell.
    fn balance(&mut self, focal_xz: Vec2, exhausted: &mut bool) {
        loop {
            let mut grew = false;
            for id in self.deepest_nodes_under(ROOT) {
                let node = *self.node(id);
                if node.has_children() || node.level < 2 {
                    // Grown earlier in this sweep, or too shallow to sit
                    // two levels below any neighbor.
                    continue;
                }
                let span = self.span_at_level(node.level) as i32;
                for side in Side::ALL {
                    let step = side.offset();
                    let outside = node.footprint + step.max(IVec2::ZERO) * (span - 1) + step;
                    let Some(neighbor) = self.node_at(outside) else {
                        continue;
                    };
                    if node.level as i32 - self.node(neighbor).level as i32 >= 2 {
                        grew |= self.grow_for_balance(neighbor, focal_xz, exhausted);
                    }
                }
            }
            if !grew {
                return;
            }
        }
    }

    /// Subdivides a leaf the balance sweep singled out. Inside a subtree
    /// that already diffed this cycle the ancestor's pair covers the
    /// change; anywhere else the node announces with its own pair. The new
    /// children run through the distance walk so refinement still reaches
    /// its fixed point in one call.
    fn grow_for_balance(&mut self, id: NodeId, focal_xz: Vec2, exhausted: &mut bool) -> bool {
        if self.subdivide(id).is_err() {
            // Leave the jump in place; the seam stays open until a
            // coarsening cycle frees blocks.
            *exhausted = true;
            return false;
        }
        if !self.node(id).was_diffed {
            self.node_mut(id).was_diffed = true;
            self.diffed_nodes.push(id);
            self.diff.push(DiffEntry {
                op: DiffOp::Delete,
                node: id,
            });
            self.diff.push(DiffEntry {
                op: DiffOp::Add,
                node: id,
            });
        }
        let first_child = self.node(id).first_child;
        for i in 0..4 {
            self.refine(NodeId(first_child.0 + i), focal_xz, true, exhausted);
        }
        true
    }

    /// Whether collapsing `id` to a leaf leaves every bordering leaf
    /// within one level of it. Each outside strip is walked leaf by leaf;
    /// an equal or coarser neighbor covers its whole strip and exits after
    /// one step.
    fn collapse_keeps_balance(&self, id: NodeId) -> bool {
        let node = self.node(id);
        let span = self.span_at_level(node.level) as i32;
        for side in Side::ALL {
            let step = side.offset();
            let base = node.footprint + step.max(IVec2::ZERO) * (span - 1) + step;
            let along = IVec2::new(step.y.abs(), step.x.abs());
            let mut offset = 0;
            while offset < span {
                let Some(neighbor) = self.node_at(base + along * offset) else {
                    break;
                };
                let level = self.node(neighbor).level;
                if level as u32 > node.level as u32 + 1 {
                    return false;
                }
                offset += self.span_at_level(level) as i32;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quadtree::{LodSettings, NodeInfo, Side};
    use glam::IVec2;

    fn tree(max_lod: u8) -> LodQuadtree {
        LodQuadtree::new(LodSettings {
            max_lod,
            ..LodSettings::default()
        })
    }

    fn leaf_infos(tree: &LodQuadtree) -> Vec<NodeInfo> {
        tree.deepest_nodes_under(ROOT)
            .iter()
            .map(|&id| tree.node_info(id).unwrap())
            .collect()
    }

    /// Leaves must tile the root footprint exactly, whatever the focal did.
    fn assert_leaves_tile_footprint(tree: &LodQuadtree) {
        let span = tree.root_span();
        let mut covered = vec![false; (span * span) as usize];
        for info in leaf_infos(tree) {
            for dz in 0..info.span {
                for dx in 0..info.span {
                    let x = info.footprint.x as u32 + dx;
                    let z = info.footprint.y as u32 + dz;
                    let idx = (z * span + x) as usize;
                    assert!(!covered[idx], "cell ({x}, {z}) covered twice");
                    covered[idx] = true;
                }
            }
        }
        assert!(covered.iter().all(|&c| c), "footprint has uncovered cells");
    }

    /// No leaf may border a leaf more than one level away; the seam layer
    /// only bridges a single level.
    fn assert_leaves_are_level_balanced(tree: &LodQuadtree) {
        for info in leaf_infos(tree) {
            let span = info.span as i32;
            for side in Side::ALL {
                let step = side.offset();
                let base = info.footprint + step.max(IVec2::ZERO) * (span - 1) + step;
                let along = IVec2::new(step.y.abs(), step.x.abs());
                for offset in 0..span {
                    let Some(neighbor) = tree.node_at(base + along * offset) else {
                        break;
                    };
                    let level = tree.node_info(neighbor).unwrap().level;
                    assert!(
                        (info.level as i32 - level as i32).abs() <= 1,
                        "level-{} leaf at {:?} borders a level-{} leaf across {:?}",
                        info.level,
                        info.footprint,
                        level,
                        side
                    );
                }
            }
        }
    }

    #[test]
    fn test_focal_at_origin_refines_nearest_cells_to_max_lod() {
        let mut t = tree(3);
        t.set_focal_point(Vec3::ZERO).unwrap();
        assert_leaves_tile_footprint(&t);

        let infos = leaf_infos(&t);
        // With the default factor the origin quadrant chain subdivides all
        // the way down: the four unit cells nearest the origin sit at
        // max_lod, surrounded by level-2 then level-1 leaves.
        let mut by_level = [0usize; 4];
        for info in &infos {
            by_level[info.level as usize] += 1;
        }
        assert_eq!(by_level, [0, 3, 3, 4]);

        let deepest: Vec<IVec2> = infos
            .iter()
            .filter(|i| i.level == 3)
            .map(|i| i.footprint)
            .collect();
        for cell in [
            IVec2::new(0, 0),
            IVec2::new(1, 0),
            IVec2::new(0, 1),
            IVec2::new(1, 1),
        ] {
            assert!(deepest.contains(&cell), "missing max-lod cell {cell:?}");
        }
    }

    #[test]
    fn test_same_focal_twice_emits_empty_diff() {
        let mut t = tree(3);
        t.set_focal_point(Vec3::new(10.0, 0.0, 10.0)).unwrap();
        assert!(!t.diff().is_empty());

        t.set_focal_point(Vec3::new(10.0, 0.0, 10.0)).unwrap();
        assert!(t.diff().is_empty());
        for id in t.deepest_nodes_under(ROOT) {
            assert!(!t.node_info(id).unwrap().was_diffed);
        }
    }

    #[test]
    fn test_diff_entries_come_in_delete_add_pairs() {
        let mut t = tree(3);
        t.set_focal_point(Vec3::ZERO).unwrap();
        let diff = t.diff();
        assert!(!diff.is_empty());
        assert_eq!(diff.len() % 2, 0);
        for pair in diff.chunks(2) {
            assert_eq!(pair[0].op, DiffOp::Delete);
            assert_eq!(pair[1].op, DiffOp::Add);
            assert_eq!(pair[0].node, pair[1].node);
        }
    }

    #[test]
    fn test_first_refinement_diffs_only_the_root() {
        let mut t = tree(3);
        t.set_focal_point(Vec3::ZERO).unwrap();
        // Every change hangs off the root's flip, so one pair covers it.
        assert_eq!(t.diff().len(), 2);
        assert_eq!(t.diff()[0].node, ROOT);
    }

    #[test]
    fn test_moving_focal_away_collapses_the_tree() {
        let mut t = tree(3);
        t.set_focal_point(Vec3::ZERO).unwrap();
        assert!(leaf_infos(&t).len() > 1);

        t.set_focal_point(Vec3::new(1.0e6, 0.0, 1.0e6)).unwrap();
        assert_leaves_tile_footprint(&t);
        assert_eq!(t.deepest_nodes_under(ROOT), vec![ROOT]);
        // The root flipped back to a leaf: exactly one pair.
        assert_eq!(t.diff().len(), 2);
        assert_eq!(t.diff()[0].node, ROOT);
    }

    #[test]
    fn test_small_focal_move_diffs_only_changed_subtree() {
        let mut t = tree(4);
        t.set_focal_point(Vec3::new(1.0, 0.0, 1.0)).unwrap();
        let leaves_before = leaf_infos(&t).len();

        // Nudge the focal within the same deepest cell: nothing changes.
        t.set_focal_point(Vec3::new(2.0, 0.0, 2.0)).unwrap();
        assert!(t.diff().is_empty());
        assert_eq!(leaf_infos(&t).len(), leaves_before);

        // A larger move flips only part of the tree.
        t.set_focal_point(Vec3::new(200.0, 0.0, 200.0)).unwrap();
        assert!(!t.diff().is_empty());
        assert_leaves_tile_footprint(&t);
        let diffed_nodes = t.diff().len() / 2;
        assert!(
            diffed_nodes < leaf_infos(&t).len(),
            "a local move must not diff every leaf"
        );
    }

    #[test]
    fn test_was_diffed_marks_whole_changed_subtree() {
        let mut t = tree(3);
        t.set_focal_point(Vec3::ZERO).unwrap();
        for id in t.deepest_nodes_under(ROOT) {
            assert!(
                t.node_info(id).unwrap().was_diffed,
                "all leaves were created this cycle"
            );
        }
    }

    #[test]
    fn test_adjacent_leaves_stay_within_one_level() {
        let mut t = tree(3);
        for z in 0..=8 {
            for x in 0..=8 {
                let focal = Vec3::new(x as f32 * 32.0, 0.0, z as f32 * 32.0);
                t.set_focal_point(focal).unwrap();
                assert_leaves_tile_footprint(&t);
                assert_leaves_are_level_balanced(&t);
            }
        }
        // Off-lattice positions push the narrow deep bands across cell
        // boundaries.
        for z in 0..8 {
            for x in 0..8 {
                let focal = Vec3::new(x as f32 * 32.0 + 8.0, 0.0, z as f32 * 32.0 + 24.0);
                t.set_focal_point(focal).unwrap();
                assert_leaves_tile_footprint(&t);
                assert_leaves_are_level_balanced(&t);
            }
        }
    }

    #[test]
    fn test_narrow_cutoff_band_grows_the_coarse_side() {
        let mut t = tree(3);
        t.set_focal_point(Vec3::new(40.0, 0.0, 16.0)).unwrap();
        assert_leaves_tile_footprint(&t);
        assert_leaves_are_level_balanced(&t);

        // The distance rule alone refines cell (3,0) to max lod while
        // leaving cell (4,0) at level 1, a two-level jump; the balance
        // pass grows the coarse side one level.
        let deep = t.node_at(IVec2::new(3, 0)).unwrap();
        assert_eq!(t.node_info(deep).unwrap().level, 3);
        let grown = t.node_at(IVec2::new(4, 0)).unwrap();
        assert_eq!(t.node_info(grown).unwrap().level, 2);
        // Growth under the root's first-refinement pair stays silent.
        assert_eq!(t.diff().len(), 2);
    }

    #[test]
    fn test_balance_growth_beyond_diffed_subtrees_pairs_itself() {
        let mut t = tree(3);
        t.set_focal_point(Vec3::new(40.0, 0.0, 240.0)).unwrap();
        t.set_focal_point(Vec3::new(40.0, 0.0, 16.0)).unwrap();
        assert_leaves_tile_footprint(&t);
        assert_leaves_are_level_balanced(&t);

        // The distance rule never touches the level-1 leaf at (4,0) this
        // cycle; no ancestor pair covers it, so its balance growth must
        // announce itself.
        let grown = t.node_at(IVec2::new(4, 0)).unwrap();
        assert_eq!(t.node_info(grown).unwrap().level, 2);
        let pair_infos: Vec<NodeInfo> = t
            .diff()
            .iter()
            .step_by(2)
            .map(|entry| t.node_info(entry.node).unwrap())
            .collect();
        assert!(
            pair_infos
                .iter()
                .any(|info| info.level == 1 && info.footprint == IVec2::new(4, 0)),
            "no diff pair for the grown leaf"
        );
    }

    #[test]
    fn test_exhausted_pool_reports_and_stays_consistent() {
        // Room for the root plus a single child block.
        let mut t = LodQuadtree::with_capacity(
            LodSettings {
                max_lod: 3,
                ..LodSettings::default()
            },
            5,
        )
        .unwrap();

        let err = t.set_focal_point(Vec3::ZERO).unwrap_err();
        assert!(matches!(err, LodError::NodePoolExhausted { .. }));
        // The root still subdivided once; the diff reflects that.
        assert_eq!(t.diff().len(), 2);
        assert_eq!(leaf_infos(&t).len(), 4);
    }
}
