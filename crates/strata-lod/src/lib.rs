//! Level-of-detail selection for the terrain footprint.
//!
//! A preallocated quadtree divides the square terrain footprint into nodes;
//! [`LodQuadtree::set_focal_point`] refines it around a camera position and
//! emits a Delete/Add diff that the mesher consumes to rebuild only the
//! regions whose resolution changed.

pub mod quadtree;
pub mod refine;

pub use quadtree::{
    full_tree_nodes, LodError, LodQuadtree, LodSettings, NodeId, NodeInfo, Side, ROOT,
};
pub use refine::{DiffEntry, DiffOp};
