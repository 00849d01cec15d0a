//! Row-major 4x4 matrix, used only to carry a view-projection matrix into
//! the frustum test: row extraction for plane clipping plus a handful of
//! vector transforms, nothing a rasterizer or shader pipeline would need.

use crate::vector::{vec4f, Vec4f32};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mat4 {
    /// Rows, in row-major order: `rows[i]` is row `i`.
    pub rows: [Vec4f32; 4],
}

impl Mat4 {
    pub fn from_rows(rows: [Vec4f32; 4]) -> Self {
        Self { rows }
    }

    pub fn identity() -> Self {
        Self::from_rows([
            vec4f(1.0, 0.0, 0.0, 0.0),
            vec4f(0.0, 1.0, 0.0, 0.0),
            vec4f(0.0, 0.0, 1.0, 0.0),
            vec4f(0.0, 0.0, 0.0, 1.0),
        ])
    }

    pub fn col(&self, i: usize) -> Vec4f32 {
        vec4f(self.rows[0][i as u32], self.rows[1][i as u32], self.rows[2][i as u32], self.rows[3][i as u32])
    }

    /// Transforms a homogeneous point `(x, y, z, 1)` by this matrix.
    pub fn transform_point(&self, p: crate::vector::Vec3f32) -> Vec4f32 {
        let v = vec4f(p.0, p.1, p.2, 1.0);
        vec4f(
            crate::vector::dot4(self.rows[0], v),
            crate::vector::dot4(self.rows[1], v),
            crate::vector::dot4(self.rows[2], v),
            crate::vector::dot4(self.rows[3], v),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::vec3f;

    #[test]
    fn identity_leaves_points_unchanged() {
        let p = vec3f(1.0, 2.0, 3.0);
        let out = Mat4::identity().transform_point(p);
        assert_eq!(out, vec4f(1.0, 2.0, 3.0, 1.0));
    }
}
