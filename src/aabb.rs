//! Axis-aligned bounding box, used for octree node cells and frustum
//! math.

use crate::vector::{vec3f, Vec3f32};

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Aabb {
    pub min: Vec3f32,
    pub max: Vec3f32,
}

impl Aabb {
    /// An AABB that contains nothing; the first `include_*` call gives it
    /// a real extent.
    pub fn empty() -> Aabb {
        Self {
            min: vec3f(f32::MAX, f32::MAX, f32::MAX),
            max: vec3f(f32::MIN, f32::MIN, f32::MIN),
        }
    }

    pub fn new(min: Vec3f32, max: Vec3f32) -> Aabb {
        Self { min, max }
    }

    pub fn include_vertex(&mut self, v: Vec3f32) {
        self.min.0 = f32::min(self.min.0, v.0);
        self.min.1 = f32::min(self.min.1, v.1);
        self.min.2 = f32::min(self.min.2, v.2);

        self.max.0 = f32::max(self.max.0, v.0);
        self.max.1 = f32::max(self.max.1, v.1);
        self.max.2 = f32::max(self.max.2, v.2);
    }

    pub fn include_aabb(&mut self, other: &Aabb) {
        self.include_vertex(other.min);
        self.include_vertex(other.max);
    }

    pub fn center(&self) -> Vec3f32 {
        (self.min + self.max) * 0.5
    }

    pub fn extent(&self) -> Vec3f32 {
        self.max - self.min
    }

    /// All 8 corners, in octant order (x msb, y, z lsb) to match the
    /// Morton codec's octant numbering.
    pub fn corners(&self) -> [Vec3f32; 8] {
        let mut out = [vec3f(0.0, 0.0, 0.0); 8];
        for octant in 0u32..8 {
            let x = if octant & 0b100 != 0 { self.max.0 } else { self.min.0 };
            let y = if octant & 0b010 != 0 { self.max.1 } else { self.min.1 };
            let z = if octant & 0b001 != 0 { self.max.2 } else { self.min.2 };
            out[octant as usize] = vec3f(x, y, z);
        }
        out
    }

    /// The child cell's AABB for the given octant, assuming `self` is a
    /// cube-ish axis-aligned cell being split evenly at its center.
    pub fn child_cell(&self, octant: u8) -> Aabb {
        let center = self.center();
        let mut min = self.min;
        let mut max = center;
        if octant & 0b100 != 0 {
            min.0 = center.0;
            max.0 = self.max.0;
        }
        if octant & 0b010 != 0 {
            min.1 = center.1;
            max.1 = self.max.1;
        }
        if octant & 0b001 != 0 {
            min.2 = center.2;
            max.2 = self.max.2;
        }
        Aabb { min, max }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_cells_partition_the_parent() {
        let parent = Aabb::new(vec3f(0.0, 0.0, 0.0), vec3f(1.0, 1.0, 1.0));
        let mut union = Aabb::empty();
        for octant in 0u8..8 {
            let child = parent.child_cell(octant);
            union.include_aabb(&child);
        }
        assert_eq!(union.min, parent.min);
        assert_eq!(union.max, parent.max);
    }

    #[test]
    fn corners_follow_octant_numbering() {
        let b = Aabb::new(vec3f(0.0, 0.0, 0.0), vec3f(1.0, 1.0, 1.0));
        let c = b.corners();
        assert_eq!(c[0], vec3f(0.0, 0.0, 0.0));
        assert_eq!(c[7], vec3f(1.0, 1.0, 1.0));
        assert_eq!(c[4], vec3f(1.0, 0.0, 0.0));
    }
}
