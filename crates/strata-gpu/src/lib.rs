//! GPU-side storage for terrain meshes.
//!
//! One preallocated `wgpu::Buffer` is carved into 4 KB blocks by
//! [`MeshArena`]; the mesher allocates a slot per mesh, uploads vertices
//! into it, and frees it when the mesh is rebuilt or dropped.

pub mod arena;

pub use arena::{ArenaError, ArenaLedger, ArenaSlot, MeshArena, BLOCK_SIZE};
