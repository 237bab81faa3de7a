//! The 4-byte voxel sample: an unsigned density plus a packed surface normal.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Densities strictly above this value are inside the terrain surface.
///
/// Both the regular and the transition extraction paths compare with
/// strict `>` through [`Voxel::is_solid`]; call sites must not reimplement
/// the comparison.
pub const SURFACE_LEVEL: u8 = 128;

/// Scale factor for one packed normal component (`127` ~ `1.0`).
const NORMAL_SCALE: f32 = 127.0;

/// One voxel sample.
///
/// `density` is an unsigned scalar field value (0 = empty space, 255 = deep
/// inside). `normal` is the field gradient packed as three scaled signed
/// bytes so a sample stays at 4 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Voxel {
    pub density: u8,
    pub normal: [i8; 3],
}

static_assertions::const_assert_eq!(std::mem::size_of::<Voxel>(), 4);

impl Voxel {
    /// Empty space: zero density, no meaningful normal.
    pub const EMPTY: Voxel = Voxel {
        density: 0,
        normal: [0, 0, 0],
    };

    /// Builds a sample from a density and an unpacked unit normal.
    pub fn new(density: u8, normal: Vec3) -> Self {
        Self {
            density,
            normal: pack_normal(normal),
        }
    }

    /// Whether this sample lies inside the surface (`density > SURFACE_LEVEL`).
    #[inline]
    pub fn is_solid(&self) -> bool {
        self.density > SURFACE_LEVEL
    }

    /// Unpacks the normal into a unit vector (zero if the packed normal is zero).
    #[inline]
    pub fn unpack_normal(&self) -> Vec3 {
        Vec3::new(
            self.normal[0] as f32,
            self.normal[1] as f32,
            self.normal[2] as f32,
        )
        .normalize_or_zero()
    }
}

/// Packs a unit normal into three signed bytes.
fn pack_normal(n: Vec3) -> [i8; 3] {
    let clamped = n.clamp(Vec3::splat(-1.0), Vec3::splat(1.0)) * NORMAL_SCALE;
    [clamped.x as i8, clamped.y as i8, clamped.z as i8]
}
