//! Preallocated-pool quadtree over the terrain footprint.
//!
//! Nodes live in a fixed table sized for a full `max_lod`-depth tree and are
//! addressed by stable [`NodeId`] indices; subdivision draws 4-child blocks
//! from a free list and collapse returns them. The tree itself only stores
//! structure; the focal-driven refinement that mutates it lives in
//! [`crate::refine`].

use glam::IVec2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::refine::DiffEntry;

/// Stable index of a node in the quadtree's node pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Sentinel for "no node".
    pub const INVALID: NodeId = NodeId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// One of the four footprint sides of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    NegX,
    PosX,
    NegZ,
    PosZ,
}

impl Side {
    pub const ALL: [Side; 4] = [Side::NegX, Side::PosX, Side::NegZ, Side::PosZ];

    /// Footprint-space step towards the neighbor on this side.
    #[inline]
    pub fn offset(self) -> IVec2 {
        match self {
            Side::NegX => IVec2::new(-1, 0),
            Side::PosX => IVec2::new(1, 0),
            Side::NegZ => IVec2::new(0, -1),
            Side::PosZ => IVec2::new(0, 1),
        }
    }
}

/// Tuning knobs for the quadtree.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LodSettings {
    /// Deepest subdivision level; leaves at `max_lod` cover one unit cell.
    pub max_lod: u8,
    /// Multiplier on the node world size forming the subdivision cutoff.
    pub subdivide_factor: f32,
    /// World-space edge length of one unit footprint cell.
    pub cell_world_size: f32,
}

impl Default for LodSettings {
    fn default() -> Self {
        Self {
            max_lod: 5,
            subdivide_factor: 1.0,
            cell_world_size: 32.0,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LodError {
    /// The preallocated node pool has no free child blocks left.
    #[error("node pool exhausted ({capacity} nodes)")]
    NodePoolExhausted { capacity: usize },
}

/// Read-only view of one node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub level: u8,
    /// Position under the parent (0–3), 0 for the root.
    pub sibling: u8,
    /// Footprint offset in unit cells.
    pub footprint: IVec2,
    /// Footprint edge length in unit cells.
    pub span: u32,
    pub is_leaf: bool,
    pub was_diffed: bool,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Node {
    pub level: u8,
    pub sibling: u8,
    pub footprint: IVec2,
    pub parent: NodeId,
    /// First of four contiguous children, or invalid for a leaf.
    pub first_child: NodeId,
    pub live: bool,
    pub was_diffed: bool,
}

impl Node {
    #[inline]
    pub fn has_children(&self) -> bool {
        self.first_child.is_valid()
    }
}

const DEAD_NODE: Node = Node {
    level: 0,
    sibling: 0,
    footprint: IVec2::ZERO,
    parent: NodeId::INVALID,
    first_child: NodeId::INVALID,
    live: false,
    was_diffed: false,
};

/// Focal-driven LOD quadtree over a `2^max_lod` × `2^max_lod` cell footprint
/// anchored at the footprint origin.
#[derive(Debug)]
pub struct LodQuadtree {
    pub(crate) settings: LodSettings,
    pub(crate) nodes: Vec<Node>,
    /// Stack of free 4-child blocks (id of the block's first node).
    pub(crate) free_blocks: Vec<NodeId>,
    pub(crate) diff: Vec<DiffEntry>,
    pub(crate) diffed_nodes: Vec<NodeId>,
}

/// Id of the root node; the root is never freed.
pub const ROOT: NodeId = NodeId(0);

impl LodQuadtree {
    /// Builds a tree with node storage for the full `max_lod`-depth tree.
    pub fn new(settings: LodSettings) -> Self {
        let capacity = full_tree_nodes(settings.max_lod);
        match Self::with_capacity(settings, capacity) {
            Ok(tree) => tree,
            // A full-depth pool always holds at least the root.
            Err(_) => unreachable!(),
        }
    }

    /// Builds a tree with an explicit node budget, for embedders that bound
    /// memory below the full-tree worst case. `capacity` counts nodes and
    /// must cover at least the root.
    pub fn with_capacity(settings: LodSettings, capacity: usize) -> Result<Self, LodError> {
        if capacity == 0 {
            return Err(LodError::NodePoolExhausted { capacity });
        }
        let mut nodes = vec![DEAD_NODE; capacity];
        nodes[0] = Node {
            level: 0,
            sibling: 0,
            footprint: IVec2::ZERO,
            parent: NodeId::INVALID,
            first_child: NodeId::INVALID,
            live: true,
            was_diffed: false,
        };
        // Everything past the root splits into 4-child blocks, handed out
        // from the top so early subdivisions get low ids.
        let block_count = (capacity - 1) / 4;
        let mut free_blocks = Vec::with_capacity(block_count);
        for block in (0..block_count).rev() {
            free_blocks.push(NodeId((1 + block * 4) as u32));
        }
        Ok(Self {
            settings,
            nodes,
            free_blocks,
            diff: Vec::new(),
            diffed_nodes: Vec::new(),
        })
    }

    pub fn settings(&self) -> &LodSettings {
        &self.settings
    }

    pub fn max_lod(&self) -> u8 {
        self.settings.max_lod
    }

    /// Footprint edge length in unit cells for a node at `level`.
    #[inline]
    pub fn span_at_level(&self, level: u8) -> u32 {
        1 << (self.settings.max_lod - level)
    }

    /// Total footprint edge length in unit cells.
    #[inline]
    pub fn root_span(&self) -> u32 {
        self.span_at_level(0)
    }

    /// The diff produced by the most recent refinement pass.
    pub fn diff(&self) -> &[DiffEntry] {
        &self.diff
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// Read-only info for a node id, or `None` if the id is dead.
    pub fn node_info(&self, id: NodeId) -> Option<NodeInfo> {
        let node = self.nodes.get(id.index())?;
        if !node.live {
            return None;
        }
        Some(NodeInfo {
            level: node.level,
            sibling: node.sibling,
            footprint: node.footprint,
            span: self.span_at_level(node.level),
            is_leaf: !node.has_children(),
            was_diffed: node.was_diffed,
        })
    }

    /// The `i`-th child of a node (0–3), if subdivided.
    pub fn child(&self, id: NodeId, i: u8) -> Option<NodeId> {
        debug_assert!(i < 4);
        let first = self.node(id).first_child;
        if first.is_valid() {
            Some(NodeId(first.0 + i as u32))
        } else {
            None
        }
    }

    /// Descends to the leaf whose footprint contains `cell`.
    ///
    /// Footprint vectors are `(x, z)`: the `y` component of an [`IVec2`]
    /// carries the world z axis.
    pub fn node_at(&self, cell: IVec2) -> Option<NodeId> {
        let span = self.root_span() as i32;
        if cell.x < 0 || cell.y < 0 || cell.x >= span || cell.y >= span {
            return None;
        }
        let mut id = ROOT;
        loop {
            let node = self.node(id);
            if !node.has_children() {
                return Some(id);
            }
            let half = self.span_at_level(node.level) as i32 / 2;
            let mid = node.footprint + IVec2::splat(half);
            let ix = (cell.x >= mid.x) as u8;
            let iz = (cell.y >= mid.y) as u8;
            id = NodeId(node.first_child.0 + (ix | iz << 1) as u32);
        }
    }

    /// Walks down to the live node of exactly `level` whose footprint starts
    /// at `footprint`, if the tree is subdivided that far there.
    pub fn node_at_level(&self, footprint: IVec2, level: u8) -> Option<NodeId> {
        let mut id = self.node_at(footprint)?;
        let node = self.node(id);
        if node.level < level {
            return None;
        }
        // node_at returns the leaf; climb back up to the requested level.
        while self.node(id).level > level {
            id = self.node(id).parent;
        }
        (self.node(id).footprint == footprint).then_some(id)
    }

    /// The node of equal level adjacent across `side`, if that exact node is
    /// live. Returns `None` past the footprint edge or where the neighbor
    /// subtree is shallower.
    pub fn neighbor_same_level(&self, id: NodeId, side: Side) -> Option<NodeId> {
        let node = self.node(id);
        let span = self.span_at_level(node.level) as i32;
        let neighbor_footprint = node.footprint + side.offset() * span;
        self.node_at_level(neighbor_footprint, node.level)
    }

    /// Collects every leaf at or below `id`, depth first.
    pub fn deepest_nodes_under(&self, id: NodeId) -> Vec<NodeId> {
        let mut leaves = Vec::new();
        self.collect_leaves(id, &mut leaves);
        leaves
    }

    fn collect_leaves(&self, id: NodeId, out: &mut Vec<NodeId>) {
        let node = self.node(id);
        if node.has_children() {
            for i in 0..4 {
                self.collect_leaves(NodeId(node.first_child.0 + i), out);
            }
        } else {
            out.push(id);
        }
    }

    /// Draws a child block from the pool and wires it under `id`.
    pub(crate) fn subdivide(&mut self, id: NodeId) -> Result<(), LodError> {
        debug_assert!(!self.node(id).has_children());
        let Some(block) = self.free_blocks.pop() else {
            return Err(LodError::NodePoolExhausted {
                capacity: self.nodes.len(),
            });
        };
        let parent = *self.node(id);
        let half = self.span_at_level(parent.level) as i32 / 2;
        for i in 0..4u8 {
            let offset = IVec2::new((i & 1) as i32, (i >> 1) as i32) * half;
            self.nodes[block.index() + i as usize] = Node {
                level: parent.level + 1,
                sibling: i,
                footprint: parent.footprint + offset,
                parent: id,
                first_child: NodeId::INVALID,
                live: true,
                was_diffed: false,
            };
        }
        self.node_mut(id).first_child = block;
        Ok(())
    }

    /// Frees the whole subtree below `id`, returning blocks to the pool.
    pub(crate) fn collapse_children(&mut self, id: NodeId) {
        let first = self.node(id).first_child;
        if !first.is_valid() {
            return;
        }
        for i in 0..4 {
            let child = NodeId(first.0 + i);
            self.collapse_children(child);
            *self.node_mut(child) = DEAD_NODE;
        }
        self.free_blocks.push(first);
        self.node_mut(id).first_child = NodeId::INVALID;
    }
}

/// Node count of a complete tree of depth `max_lod` (`Σ 4^level`).
pub fn full_tree_nodes(max_lod: u8) -> usize {
    (0..=max_lod as u32).map(|l| 4usize.pow(l)).sum()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
