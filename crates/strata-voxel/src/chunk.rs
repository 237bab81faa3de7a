//! Fixed-size voxel chunks addressed by 3D chunk coordinates.

use glam::IVec3;

use crate::store::ChunkId;
use crate::voxel::Voxel;

/// Chunk edge length in voxels.
pub const CHUNK_DIM: usize = 32;
/// Total voxels per chunk.
pub const CHUNK_VOLUME: usize = CHUNK_DIM * CHUNK_DIM * CHUNK_DIM;

/// A `CHUNK_DIM`³ block of voxel samples with its chunk-space coordinate.
///
/// Chunks sharing an `(x, z)` column are linked through `next_in_column`
/// into a singly linked chain owned by the store; the link is a stable
/// table index, never a pointer.
#[derive(Clone, Debug)]
pub struct Chunk {
    coord: IVec3,
    voxels: Box<[Voxel]>,
    pub(crate) next_in_column: ChunkId,
}

impl Chunk {
    /// Creates an empty chunk at the given chunk coordinate.
    pub fn new(coord: IVec3) -> Self {
        Self {
            coord,
            voxels: vec![Voxel::EMPTY; CHUNK_VOLUME].into_boxed_slice(),
            next_in_column: ChunkId::INVALID,
        }
    }

    /// The chunk-space coordinate (world voxel position / `CHUNK_DIM`).
    #[inline]
    pub fn coord(&self) -> IVec3 {
        self.coord
    }

    /// The next chunk in this `(x, z)` column, if any.
    #[inline]
    pub fn next_in_column(&self) -> Option<ChunkId> {
        if self.next_in_column.is_valid() {
            Some(self.next_in_column)
        } else {
            None
        }
    }

    /// Reads the voxel at chunk-local `(x, y, z)`.
    #[inline]
    pub fn voxel(&self, x: usize, y: usize, z: usize) -> Voxel {
        self.voxels[linear_index(x, y, z)]
    }

    /// Writes the voxel at chunk-local `(x, y, z)`.
    #[inline]
    pub fn set_voxel(&mut self, x: usize, y: usize, z: usize, voxel: Voxel) {
        self.voxels[linear_index(x, y, z)] = voxel;
    }

    /// Fills the whole chunk with one sample.
    pub fn fill(&mut self, voxel: Voxel) {
        self.voxels.fill(voxel);
    }

    /// Raw sample slice in `x + y * CHUNK_DIM + z * CHUNK_DIM²` order.
    #[inline]
    pub fn voxels(&self) -> &[Voxel] {
        &self.voxels
    }
}

/// Maps chunk-local `(x, y, z)` to an index into the voxel slice.
#[inline]
pub fn linear_index(x: usize, y: usize, z: usize) -> usize {
    debug_assert!(x < CHUNK_DIM && y < CHUNK_DIM && z < CHUNK_DIM);
    x + y * CHUNK_DIM + z * CHUNK_DIM * CHUNK_DIM
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
