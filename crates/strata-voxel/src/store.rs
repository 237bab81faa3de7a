//! Sparse chunk storage: a stable-index chunk table with packed-key lookup
//! and per-column chains for vertical traversal.

use glam::IVec3;
use rustc_hash::FxHashMap;

use crate::chunk::{CHUNK_DIM, Chunk};
use crate::voxel::Voxel;

/// Stable index of a chunk in the store's chunk table.
///
/// The table never evicts, so an id stays valid for the life of the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChunkId(pub u32);

impl ChunkId {
    /// Sentinel for "no chunk".
    pub const INVALID: ChunkId = ChunkId(u32::MAX);

    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Sparse voxel world, grown lazily as chunks are touched.
///
/// Chunks are addressed by a key packing 10 bits per axis, which limits the
/// addressable world to ±512 chunks on each axis; coordinates outside that
/// range alias. Chunks at the same `(x, z)` form a column chain, newest
/// first; walkers must not rely on chain order.
#[derive(Default)]
pub struct VoxelStore {
    chunks: Vec<Chunk>,
    by_coord: FxHashMap<u32, ChunkId>,
    column_heads: FxHashMap<u32, ChunkId>,
}

impl VoxelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunks the store holds.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Looks up a chunk by table id.
    #[inline]
    pub fn chunk(&self, id: ChunkId) -> Option<&Chunk> {
        self.chunks.get(id.index())
    }

    /// Looks up a chunk by chunk coordinate without creating it.
    pub fn chunk_at(&self, coord: IVec3) -> Option<&Chunk> {
        let id = *self.by_coord.get(&pack_key(coord))?;
        self.chunk(id)
    }

    /// Mutable lookup by chunk coordinate without creating.
    pub fn chunk_at_mut(&mut self, coord: IVec3) -> Option<&mut Chunk> {
        let id = *self.by_coord.get(&pack_key(coord))?;
        self.chunks.get_mut(id.index())
    }

    /// Returns the chunk at `coord`, creating and column-linking it first if
    /// it does not exist yet.
    pub fn chunk_mut_or_insert(&mut self, coord: IVec3) -> &mut Chunk {
        let key = pack_key(coord);
        if let Some(&id) = self.by_coord.get(&key) {
            return &mut self.chunks[id.index()];
        }

        let id = ChunkId(self.chunks.len() as u32);
        let mut chunk = Chunk::new(coord);
        let column = pack_column_key(coord.x, coord.z);
        if let Some(&head) = self.column_heads.get(&column) {
            chunk.next_in_column = head;
        }
        self.column_heads.insert(column, id);
        self.by_coord.insert(key, id);
        self.chunks.push(chunk);
        tracing::debug!(?coord, "created chunk");
        &mut self.chunks[id.index()]
    }

    /// First chunk in the `(x, z)` column chain, if the column has any.
    pub fn column_head(&self, x: i32, z: i32) -> Option<ChunkId> {
        self.column_heads.get(&pack_column_key(x, z)).copied()
    }

    /// Iterates every chunk in the `(x, z)` column, following the chain.
    pub fn column_chunks(&self, x: i32, z: i32) -> impl Iterator<Item = &Chunk> {
        let mut cursor = self.column_head(x, z);
        std::iter::from_fn(move || {
            let chunk = self.chunk(cursor?)?;
            cursor = chunk.next_in_column();
            Some(chunk)
        })
    }

    /// Reads the voxel at a world voxel position, resolving the owning chunk
    /// transparently. Positions in unloaded chunks read as empty space.
    pub fn voxel_at(&self, world_voxel: IVec3) -> Voxel {
        let dim = IVec3::splat(CHUNK_DIM as i32);
        let chunk_coord = world_voxel.div_euclid(dim);
        let local = world_voxel.rem_euclid(dim);
        match self.chunk_at(chunk_coord) {
            Some(chunk) => chunk.voxel(local.x as usize, local.y as usize, local.z as usize),
            None => Voxel::EMPTY,
        }
    }
}

/// Packs a chunk coordinate into the 10-bits-per-axis store key.
#[inline]
fn pack_key(coord: IVec3) -> u32 {
    let x = (coord.x & 0x3FF) as u32;
    let y = (coord.y & 0x3FF) as u32;
    let z = (coord.z & 0x3FF) as u32;
    x | y << 10 | z << 20
}

/// Packs an `(x, z)` column coordinate the same way.
#[inline]
fn pack_column_key(x: i32, z: i32) -> u32 {
    let x = (x & 0x3FF) as u32;
    let z = (z & 0x3FF) as u32;
    x | z << 10
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
