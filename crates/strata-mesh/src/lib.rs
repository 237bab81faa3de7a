//! Surface extraction for the adaptive terrain: marching cubes over iso
//! groups, transition seams between resolution levels, and the diff-driven
//! mesher that keeps CPU meshes and the GPU arena in step with the
//! quadtree.

pub mod extract;
pub mod group;
pub mod mesher;
pub mod tables;
pub mod transition;
pub mod vertex;
pub mod worker;

pub use extract::{extract_regular, polygonize_cell, surface_crossing};
pub use group::{GroupId, GroupKey, GroupTable, IsoGroup, MeshSlot};
pub use mesher::{
    footprint_to_world, world_to_footprint, IsoGroupSnapshot, MeshError, MesherConfig,
    TerrainMesher,
};
pub use transition::{extract_transition, Face};
pub use vertex::{TerrainVertex, TERRAIN_VERTEX_LAYOUT};
pub use worker::{IdleWorker, MesherState, TaskHandle, TaskPool, TerrainWorker};
