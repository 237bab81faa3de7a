//! Sparse voxel storage: density/normal samples in 32³ chunks, indexed by
//! packed coordinate keys, with column chains for vertical traversal.

pub mod chunk;
pub mod store;
pub mod voxel;

pub use chunk::{CHUNK_DIM, CHUNK_VOLUME, Chunk, linear_index};
pub use store::{ChunkId, VoxelStore};
pub use voxel::{SURFACE_LEVEL, Voxel};
