//! Mapping from a world AABB + max level to Morton-addressable cells.

use crate::aabb::Aabb;
use crate::error::{OctError, Result};
use crate::morton::MortonCode;
use crate::vector::{vec3f, Vec3f32};

/// World-space origin, size and subdivision depth of an octree.
///
/// All input points are expected to satisfy `origin <= p < origin + size`
/// after the external sorter's uniform pre-scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OctreeDim {
    pub origin: Vec3f32,
    pub size: Vec3f32,
    pub max_level: u32,
}

impl OctreeDim {
    pub fn new(origin: Vec3f32, size: Vec3f32, max_level: u32) -> Self {
        Self {
            origin,
            size,
            max_level,
        }
    }

    /// `size / 2^max_level`: the extent of a single leaf cell.
    pub fn leaf_size(&self) -> Vec3f32 {
        let divisor = (1u32 << self.max_level) as f32;
        self.size / divisor
    }

    pub fn root_aabb(&self) -> Aabb {
        Aabb::new(self.origin, self.origin + self.size)
    }

    /// Maps a world point to the Morton code of the leaf cell containing
    /// it at `self.max_level`, by `floor((p - origin) / (size / 2^L))`
    /// per axis then interleaving.
    pub fn morton_of<M: MortonCode>(&self, p: Vec3f32) -> Result<M> {
        self.morton_of_at_level(p, self.max_level)
    }

    /// As [`Self::morton_of`], but at an arbitrary level `<= max_level`
    /// (used by the builder while assembling inner levels).
    pub fn morton_of_at_level<M: MortonCode>(&self, p: Vec3f32, level: u32) -> Result<M> {
        let cells = (1u32 << level) as f32;
        let rel = (p - self.origin) * vec3_recip(self.size);
        let gx = (rel.0 * cells).floor();
        let gy = (rel.1 * cells).floor();
        let gz = (rel.2 * cells).floor();
        if gx < 0.0 || gy < 0.0 || gz < 0.0 {
            return Err(OctError::CorruptInput(format!(
                "point {p:?} lies outside the octree AABB (origin {:?}, size {:?})",
                self.origin, self.size
            )));
        }
        let max_index = cells as u32 - 1;
        let x = (gx as u32).min(max_index);
        let y = (gy as u32).min(max_index);
        let z = (gz as u32).min(max_index);
        M::from_coords(x, y, z, level)
    }

    /// The AABB of the cell addressed by `code`, derived by walking the
    /// code's decoded grid coordinates.
    pub fn aabb_of<M: MortonCode>(&self, code: M) -> Aabb {
        let (x, y, z, level) = code.decode();
        let cells = (1u32 << level) as f32;
        let cell_size = self.size / cells;
        let min = self.origin
            + vec3f(
                x as f32 * cell_size.0,
                y as f32 * cell_size.1,
                z as f32 * cell_size.2,
            );
        Aabb::new(min, min + cell_size)
    }
}

fn vec3_recip(v: Vec3f32) -> Vec3f32 {
    vec3f(1.0 / v.0, 1.0 / v.1, 1.0 / v.2)
}
