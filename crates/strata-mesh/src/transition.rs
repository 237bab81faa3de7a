//! Seam meshing between neighboring groups.
//!
//! Adjacent groups do not share sample planes, so the cell layer between two
//! groups is meshed here rather than by the regular pass. Two cases:
//!
//! - **Equal LOD**: the boundary cells are ordinary marching cubes cells
//!   whose far corners read the neighbor's samples. The group on the
//!   negative side owns the band, so each seam is built exactly once. The
//!   outermost cell layer is split between the three positive faces.
//! - **Coarser neighbor**: the gap is bridged with transition cells. Each
//!   cell contours a 3x3 fine-sample patch of the boundary plane and
//!   extrudes the contour across the gap to the coarse neighbor's sample
//!   plane, walling the seam shut. Coarse-end normals blend in the nearest
//!   coarse corner sample at one eighth so lighting does not step at the
//!   boundary.
//!
//! A finer neighbor is never stitched against from this side; the finer
//! group builds the same seam from its side. Cells whose samples are not all
//! loaded are skipped and picked up on a later cycle.

use glam::{IVec3, Vec3};

use strata_voxel::{CHUNK_DIM, Voxel};

use crate::extract::{lattice_to_world, polygonize_cell, surface_crossing};
use crate::group::{GroupKey, GroupTable};
use crate::tables::{
    CORNER_OFFSETS, TRANSITION_CELL_CLASS, TRANSITION_CELL_DATA, TRANSITION_WINDING_BIT,
};
use crate::vertex::TerrainVertex;

/// One of a group's six faces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Face {
    NegX,
    PosX,
    NegY,
    PosY,
    NegZ,
    PosZ,
}

impl Face {
    pub const ALL: [Face; 6] = [
        Face::NegX,
        Face::PosX,
        Face::NegY,
        Face::PosY,
        Face::NegZ,
        Face::PosZ,
    ];

    /// Step to the face-adjacent group coordinate.
    pub fn offset(self) -> IVec3 {
        match self {
            Face::NegX => IVec3::NEG_X,
            Face::PosX => IVec3::X,
            Face::NegY => IVec3::NEG_Y,
            Face::PosY => IVec3::Y,
            Face::NegZ => IVec3::NEG_Z,
            Face::PosZ => IVec3::Z,
        }
    }

    #[inline]
    pub fn is_positive(self) -> bool {
        matches!(self, Face::PosX | Face::PosY | Face::PosZ)
    }

    /// Axis index the face is normal to.
    fn normal_axis(self) -> usize {
        match self {
            Face::NegX | Face::PosX => 0,
            Face::NegY | Face::PosY => 1,
            Face::NegZ | Face::PosZ => 2,
        }
    }

    /// Tangential axis indices `(u, v)`, chosen so `(u, v, outward)` is a
    /// right-handed frame. Contour segments keep the solid side on the left
    /// in `(u, v)`, which makes the extruded walls face away from it.
    fn tangent_axes(self) -> (usize, usize) {
        match self {
            Face::PosX => (1, 2),
            Face::NegX => (2, 1),
            Face::PosY => (2, 0),
            Face::NegY => (0, 2),
            Face::PosZ => (0, 1),
            Face::NegZ => (1, 0),
        }
    }
}

/// What a face borders on, as far as stitching is concerned.
enum FaceRelation {
    Equal,
    Coarser,
    None,
}

/// Classifies a face against the live group table. A coarser neighbor can
/// only sit across a parent-cell boundary; inside the parent the candidate
/// coordinate collapses onto the group's own parent and is rejected.
fn face_relation(groups: &GroupTable, key: GroupKey, face: Face) -> FaceRelation {
    let equal = GroupKey {
        coord: key.coord + face.offset(),
        level: key.level,
    };
    if groups.id_by_key(equal).is_some() {
        return FaceRelation::Equal;
    }

    if key.level > 0 {
        let two = IVec3::splat(2);
        let coarse_coord = (key.coord + face.offset()).div_euclid(two);
        if coarse_coord != key.coord.div_euclid(two) {
            let coarse = GroupKey {
                coord: coarse_coord,
                level: key.level - 1,
            };
            if groups.id_by_key(coarse).is_some() {
                return FaceRelation::Coarser;
            }
        }
    }
    FaceRelation::None
}

/// Level of a group covering the face-adjacent region from more than one
/// level up, if one exists. Refinement keeps adjacent leaves within one
/// level, so a hit means the tree side broke that bound and this face has
/// no transition to build.
fn distant_coarser_level(groups: &GroupTable, key: GroupKey, face: Face) -> Option<u8> {
    let neighbor = key.coord + face.offset();
    for level in (0..key.level.saturating_sub(1)).rev() {
        let scale = IVec3::splat(1 << (key.level - level));
        let coarse_coord = neighbor.div_euclid(scale);
        // The group's own ancestor cell does not border this face.
        if coarse_coord == key.coord.div_euclid(scale) {
            continue;
        }
        let candidate = GroupKey {
            coord: coarse_coord,
            level,
        };
        if groups.id_by_key(candidate).is_some() {
            return Some(level);
        }
    }
    None
}

/// Extracts a group's transition mesh, appending to `out`: equal-LOD seam
/// bands on positive faces plus transition cells against coarser neighbors.
pub fn extract_transition(
    groups: &GroupTable,
    key: GroupKey,
    max_lod: u8,
    out: &mut Vec<TerrainVertex>,
) {
    for face in Face::ALL {
        match face_relation(groups, key, face) {
            FaceRelation::Equal => {
                if face.is_positive() {
                    extract_equal_band(groups, key, face, max_lod, out);
                }
            }
            FaceRelation::Coarser => extract_transition_cells(groups, key, face, max_lod, out),
            FaceRelation::None => {
                // Empty space, or a finer neighbor that owns this seam. A
                // group more than one level up is neither; that face stays
                // open, so say so instead of failing silently.
                if let Some(level) = distant_coarser_level(groups, key, face) {
                    tracing::warn!(
                        coord = ?key.coord,
                        level = key.level,
                        ?face,
                        neighbor_level = level,
                        "face neighbor more than one level coarser, seam left open"
                    );
                }
            }
        }
    }
}

/// Marching cubes over the boundary cells owned by one positive face.
fn extract_equal_band(
    groups: &GroupTable,
    key: GroupKey,
    face: Face,
    max_lod: u8,
    out: &mut Vec<TerrainVertex>,
) {
    let stride_log2 = (max_lod - key.level) as u32;
    let origin = key.coord * CHUNK_DIM as i32;
    let last = CHUNK_DIM as i32 - 1;

    // Inclusive origin bounds; the three positive faces partition the
    // outermost cell layer.
    let (x_range, y_range, z_range) = match face {
        Face::PosX => ([last, last], [0, last - 1], [0, last - 1]),
        Face::PosY => ([0, last], [last, last], [0, last - 1]),
        Face::PosZ => ([0, last], [0, last], [last, last]),
        _ => unreachable!(),
    };

    for z in z_range[0]..=z_range[1] {
        for y in y_range[0]..=y_range[1] {
            for x in x_range[0]..=x_range[1] {
                let cell = origin + IVec3::new(x, y, z);
                let mut corners = [(Vec3::ZERO, Voxel::EMPTY); 8];
                let mut complete = true;
                for (i, offset) in CORNER_OFFSETS.iter().enumerate() {
                    let lattice = cell + IVec3::from_array(*offset);
                    match groups.sample_at(key.level, lattice) {
                        Some(sample) => {
                            corners[i] = (lattice_to_world(lattice, stride_log2), sample);
                        }
                        None => {
                            complete = false;
                            break;
                        }
                    }
                }
                if complete {
                    polygonize_cell(&corners, out);
                }
            }
        }
    }
}

/// Walls the seam against a coarser face neighbor with transition cells.
///
/// The fine boundary plane is contoured in 3x3-sample patches; each contour
/// segment becomes a wall quad reaching the coarse neighbor's nearest sample
/// plane. That plane is 1 fine lattice unit out on a positive face and 2
/// units back on a negative face, because sample planes sit at the low edge
/// of the region a sample covers.
fn extract_transition_cells(
    groups: &GroupTable,
    key: GroupKey,
    face: Face,
    max_lod: u8,
    out: &mut Vec<TerrainVertex>,
) {
    debug_assert!(key.level > 0);
    let stride_log2 = (max_lod - key.level) as u32;
    let (u_axis, v_axis) = face.tangent_axes();
    let n_axis = face.normal_axis();
    let origin = key.coord * CHUNK_DIM as i32;
    let last = CHUNK_DIM as i32 - 1;

    let (fine_plane, coarse_plane) = if face.is_positive() {
        (origin[n_axis] + last, origin[n_axis] + last + 1)
    } else {
        (origin[n_axis], origin[n_axis] - 2)
    };

    // World-space offset from a fine-plane point to its coarse-plane image.
    let mut gap = Vec3::ZERO;
    gap[n_axis] = ((coarse_plane - fine_plane) * (1 << stride_log2)) as f32;

    for pv in 0..CHUNK_DIM as i32 / 2 {
        for pu in 0..CHUNK_DIM as i32 / 2 {
            let anchor_u = origin[u_axis] + 2 * pu;
            let anchor_v = origin[v_axis] + 2 * pv;

            let mut fine = [(Vec3::ZERO, Voxel::EMPTY); 9];
            let mut complete = true;
            'gather: for dv in 0..3 {
                for du in 0..3 {
                    let mut lattice = IVec3::ZERO;
                    lattice[u_axis] = anchor_u + du;
                    lattice[v_axis] = anchor_v + dv;
                    lattice[n_axis] = fine_plane;
                    match groups.sample_at(key.level, lattice) {
                        Some(sample) => {
                            fine[(dv * 3 + du) as usize] =
                                (lattice_to_world(lattice, stride_log2), sample);
                        }
                        None => {
                            complete = false;
                            break 'gather;
                        }
                    }
                }
            }
            if !complete {
                continue;
            }

            let mut code = 0usize;
            for (i, (_, sample)) in fine.iter().enumerate() {
                if sample.is_solid() {
                    code |= 1 << i;
                }
            }
            if code == 0 || code == 0x1FF {
                continue;
            }

            // The four coarse corner samples, normals only: positions come
            // from projecting fine crossings across the gap.
            let mut coarse_normals = [Vec3::ZERO; 4];
            let mut complete = true;
            for cv in 0..2 {
                for cu in 0..2 {
                    let mut lattice = IVec3::ZERO;
                    lattice[u_axis] = anchor_u + 2 * cu;
                    lattice[v_axis] = anchor_v + 2 * cv;
                    lattice[n_axis] = coarse_plane;
                    debug_assert_eq!(lattice.rem_euclid(IVec3::splat(2)), IVec3::ZERO);
                    match groups.sample_at(key.level - 1, lattice.div_euclid(IVec3::splat(2))) {
                        Some(sample) => {
                            coarse_normals[(cv * 2 + cu) as usize] = sample.unpack_normal();
                        }
                        None => complete = false,
                    }
                }
            }
            if !complete {
                continue;
            }

            let class = TRANSITION_CELL_CLASS[code];
            let flip = class & TRANSITION_WINDING_BIT != 0;
            let data = &TRANSITION_CELL_DATA[(class & !TRANSITION_WINDING_BIT) as usize];

            for segment in &data.segments[..data.segment_count as usize] {
                let p0 = surface_crossing(fine[segment[0] as usize], fine[segment[1] as usize]);
                let p1 = surface_crossing(fine[segment[2] as usize], fine[segment[3] as usize]);
                let q0 = coarse_end(p0, gap, coarse_normals[nearest_corner(segment[0], segment[1])]);
                let q1 = coarse_end(p1, gap, coarse_normals[nearest_corner(segment[2], segment[3])]);

                emit_triangle(out, p0, p1, q1, flip);
                emit_triangle(out, p0, q1, q0, flip);
            }
        }
    }
}

/// Index into the 2x2 coarse corner array nearest to a crossing between two
/// face samples. Crossings centered between corners round up.
fn nearest_corner(a: u8, b: u8) -> usize {
    let u = (a % 3 + b % 3) as usize;
    let v = (a / 3 + b / 3) as usize;
    usize::from(v >= 2) * 2 + usize::from(u >= 2)
}

/// Projects a fine crossing onto the coarse plane, blending in the nearest
/// coarse corner normal at one eighth.
fn coarse_end(p: TerrainVertex, gap: Vec3, corner_normal: Vec3) -> TerrainVertex {
    let normal = (Vec3::from_array(p.normal) * 0.875 + corner_normal * 0.125).normalize_or_zero();
    TerrainVertex {
        position: (Vec3::from_array(p.position) + gap).to_array(),
        normal: normal.to_array(),
    }
}

fn emit_triangle(
    out: &mut Vec<TerrainVertex>,
    a: TerrainVertex,
    b: TerrainVertex,
    c: TerrainVertex,
    flip: bool,
) {
    if flip {
        out.push(a);
        out.push(c);
        out.push(b);
    } else {
        out.push(a);
        out.push(b);
        out.push(c);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
