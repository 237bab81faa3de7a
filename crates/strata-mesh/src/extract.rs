//! Regular-cell surface extraction over one iso group's sample buffer.
//!
//! Cells are unit cubes on the group's sample lattice. The last lattice row
//! per axis is left to the seam pass: cells with an origin coordinate of
//! `CHUNK_DIM - 1` reach into a neighbor group's samples and belong to the
//! transition mesh, so the regular mesh stays self-contained.

use glam::{IVec3, Vec3};

use strata_voxel::{CHUNK_DIM, SURFACE_LEVEL, Voxel};

use crate::group::IsoGroup;
use crate::tables::{CORNER_OFFSETS, EDGE_CONNECTIONS, EDGE_TABLE, TRI_TABLE};
use crate::vertex::TerrainVertex;

/// Maps a sample-lattice position to world space. A level's lattice spacing
/// is `2^(max_lod - level)` voxels of one world unit each.
#[inline]
pub(crate) fn lattice_to_world(lattice: IVec3, stride_log2: u32) -> Vec3 {
    (lattice * (1 << stride_log2)).as_vec3()
}

/// The surface crossing on a cell edge, interpolated between the edge's two
/// samples.
///
/// Endpoints are reordered so the lower density always interpolates toward
/// the higher one; both extraction paths get bit-identical crossings on a
/// shared edge regardless of which side called.
pub fn surface_crossing(a: (Vec3, Voxel), b: (Vec3, Voxel)) -> TerrainVertex {
    let ((lo_pos, lo), (hi_pos, hi)) = if a.1.density <= b.1.density {
        (a, b)
    } else {
        (b, a)
    };
    debug_assert!(
        !lo.is_solid() && hi.is_solid(),
        "crossing requested on an uncrossed edge"
    );
    let t = (SURFACE_LEVEL as f32 - lo.density as f32) / (hi.density as f32 - lo.density as f32);
    let position = lo_pos.lerp(hi_pos, t);
    let normal = lo
        .unpack_normal()
        .lerp(hi.unpack_normal(), t)
        .normalize_or_zero();
    TerrainVertex {
        position: position.to_array(),
        normal: normal.to_array(),
    }
}

/// Polygonizes one cell from its 8 corner positions and samples, appending
/// unindexed triangles to `out`.
///
/// Corner `i` sets bit `i` of the case code when its sample is solid. The
/// case tables wind triangles toward the solid side; emission reverses each
/// triple so front faces point out of the terrain.
pub fn polygonize_cell(corners: &[(Vec3, Voxel); 8], out: &mut Vec<TerrainVertex>) {
    let mut code = 0usize;
    for (i, (_, sample)) in corners.iter().enumerate() {
        if sample.is_solid() {
            code |= 1 << i;
        }
    }
    let crossed = EDGE_TABLE[code];
    if crossed == 0 {
        return;
    }

    let mut edge_vertices = [TerrainVertex::default(); 12];
    for (edge, &[a, b]) in EDGE_CONNECTIONS.iter().enumerate() {
        if crossed & (1 << edge) != 0 {
            edge_vertices[edge] = surface_crossing(corners[a], corners[b]);
        }
    }

    let triangles = &TRI_TABLE[code];
    let mut i = 0;
    while triangles[i] >= 0 {
        out.push(edge_vertices[triangles[i] as usize]);
        out.push(edge_vertices[triangles[i + 2] as usize]);
        out.push(edge_vertices[triangles[i + 1] as usize]);
        i += 3;
    }
}

/// Extracts the regular mesh for a group, appending to `out`.
///
/// Scans every self-contained cell of the sample buffer, origins
/// `0..CHUNK_DIM - 1` per axis, in world-space coordinates of the group's
/// level.
pub fn extract_regular(group: &IsoGroup, max_lod: u8, out: &mut Vec<TerrainVertex>) {
    let key = group.key();
    debug_assert!(key.level <= max_lod);
    let stride_log2 = (max_lod - key.level) as u32;
    let origin = key.coord * CHUNK_DIM as i32;

    for z in 0..CHUNK_DIM - 1 {
        for y in 0..CHUNK_DIM - 1 {
            for x in 0..CHUNK_DIM - 1 {
                let mut corners = [(Vec3::ZERO, Voxel::EMPTY); 8];
                for (i, offset) in CORNER_OFFSETS.iter().enumerate() {
                    let cx = x + offset[0] as usize;
                    let cy = y + offset[1] as usize;
                    let cz = z + offset[2] as usize;
                    let lattice = origin + IVec3::new(cx as i32, cy as i32, cz as i32);
                    corners[i] = (
                        lattice_to_world(lattice, stride_log2),
                        group.sample(cx, cy, cz),
                    );
                }
                polygonize_cell(&corners, out);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupKey;

    /// Unit-cube corners with the given densities, normals all +Y.
    fn cell(densities: [u8; 8]) -> [(Vec3, Voxel); 8] {
        let mut corners = [(Vec3::ZERO, Voxel::EMPTY); 8];
        for i in 0..8 {
            let p = Vec3::new(
                CORNER_OFFSETS[i][0] as f32,
                CORNER_OFFSETS[i][1] as f32,
                CORNER_OFFSETS[i][2] as f32,
            );
            corners[i] = (p, Voxel::new(densities[i], Vec3::Y));
        }
        corners
    }

    fn contains_position(verts: &[TerrainVertex], expected: Vec3) -> bool {
        verts
            .iter()
            .any(|v| Vec3::from_array(v.position).distance(expected) < 1e-5)
    }

    #[test]
    fn test_uniform_cells_emit_nothing() {
        let mut out = Vec::new();
        polygonize_cell(&cell([0; 8]), &mut out);
        polygonize_cell(&cell([255; 8]), &mut out);
        // Densities at the exact threshold count as outside, still uniform.
        polygonize_cell(&cell([SURFACE_LEVEL; 8]), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_single_solid_corner_crosses_its_three_edges() {
        let mut out = Vec::new();
        polygonize_cell(&cell([255, 0, 0, 0, 0, 0, 0, 0]), &mut out);
        assert_eq!(out.len(), 3);

        // Edge crossings sit at t = 128/255 from the solid corner.
        let t = SURFACE_LEVEL as f32 / 255.0;
        assert!(contains_position(&out, Vec3::new(1.0 - t, 0.0, 0.0)));
        assert!(contains_position(&out, Vec3::new(0.0, 1.0 - t, 0.0)));
        assert!(contains_position(&out, Vec3::new(0.0, 0.0, 1.0 - t)));
    }

    #[test]
    fn test_winding_faces_away_from_the_solid() {
        let mut out = Vec::new();
        polygonize_cell(&cell([255, 0, 0, 0, 0, 0, 0, 0]), &mut out);
        assert_eq!(out.len(), 3);

        let a = Vec3::from_array(out[0].position);
        let b = Vec3::from_array(out[1].position);
        let c = Vec3::from_array(out[2].position);
        let normal = (b - a).cross(c - a);
        // Solid corner is the cell origin; outward is the (1,1,1) octant.
        assert!(normal.dot(Vec3::ONE) > 0.0, "triangle faces the solid");
    }

    #[test]
    fn test_crossing_is_canonical_for_swapped_endpoints() {
        let a = (Vec3::ZERO, Voxel::new(40, Vec3::Y));
        let b = (Vec3::X, Voxel::new(200, Vec3::Z));
        assert_eq!(surface_crossing(a, b), surface_crossing(b, a));
    }

    #[test]
    fn test_flat_floor_lies_at_interpolated_height() {
        let solid = Voxel::new(255, Vec3::Y);
        let mut group = IsoGroup::new(GroupKey {
            coord: IVec3::ZERO,
            level: 3,
        });
        for z in 0..CHUNK_DIM {
            for y in 0..16 {
                for x in 0..CHUNK_DIM {
                    group.set_sample(x, y, z, solid);
                }
            }
        }

        let mut out = Vec::new();
        extract_regular(&group, 3, &mut out);

        // One quad per interior cell column, crossing between y = 15 and 16.
        let columns = (CHUNK_DIM - 1) * (CHUNK_DIM - 1);
        assert_eq!(out.len(), columns * 2 * 3);
        let expected_y = 16.0 - SURFACE_LEVEL as f32 / 255.0;
        for vertex in &out {
            assert!((vertex.position[1] - expected_y).abs() < 1e-5);
            let normal = Vec3::from_array(vertex.normal);
            assert!(normal.dot(Vec3::Y) > 0.99, "floor normal {normal:?}");
        }
    }

    #[test]
    fn test_world_positions_scale_with_level() {
        let solid = Voxel::new(255, Vec3::Y);
        // The same sample pattern in a coarser group, one level up: every
        // position doubles because the lattice spacing doubles.
        let mut fine = IsoGroup::new(GroupKey {
            coord: IVec3::ZERO,
            level: 3,
        });
        let mut coarse = IsoGroup::new(GroupKey {
            coord: IVec3::ZERO,
            level: 2,
        });
        for z in 0..CHUNK_DIM {
            for x in 0..CHUNK_DIM {
                fine.set_sample(x, 0, z, solid);
                coarse.set_sample(x, 0, z, solid);
            }
        }

        let mut fine_out = Vec::new();
        let mut coarse_out = Vec::new();
        extract_regular(&fine, 3, &mut fine_out);
        extract_regular(&coarse, 3, &mut coarse_out);

        assert_eq!(fine_out.len(), coarse_out.len());
        assert!(!fine_out.is_empty());
        for (f, c) in fine_out.iter().zip(&coarse_out) {
            let fine_pos = Vec3::from_array(f.position);
            let coarse_pos = Vec3::from_array(c.position);
            assert!((fine_pos * 2.0).distance(coarse_pos) < 1e-4);
        }
    }
}
