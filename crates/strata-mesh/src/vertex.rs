//! Vertex format shared by the regular and transition terrain meshes.

use std::mem;

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use wgpu::{VertexAttribute, VertexBufferLayout, VertexFormat, VertexStepMode};

/// One triangle-list vertex in world space.
///
/// Meshes are non-indexed; extraction appends vertices in groups of three.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct TerrainVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

const_assert_eq!(mem::size_of::<TerrainVertex>(), 24);

/// Vertex attributes for terrain render pipelines.
pub const TERRAIN_VERTEX_ATTRIBUTES: [VertexAttribute; 2] = [
    VertexAttribute {
        format: VertexFormat::Float32x3,
        offset: 0,
        shader_location: 0,
    },
    VertexAttribute {
        format: VertexFormat::Float32x3,
        offset: 12,
        shader_location: 1,
    },
];

/// The terrain vertex buffer layout; all terrain pipelines reference this
/// one constant so the arena buffer binds identically everywhere.
pub const TERRAIN_VERTEX_LAYOUT: VertexBufferLayout<'static> = VertexBufferLayout {
    array_stride: mem::size_of::<TerrainVertex>() as u64,
    step_mode: VertexStepMode::Vertex,
    attributes: &TERRAIN_VERTEX_ATTRIBUTES,
};

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
