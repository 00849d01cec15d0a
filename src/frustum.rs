//! Frustum culling and screen-space projection size tests.
//!
//! Plane extraction follows the standard Gribb/Hartmann derivation from
//! the rows of a row-major view-projection matrix: `left = row3 + row0`,
//! `right = row3 - row0`, and so on for bottom/top and near/far. A plane
//! is stored as `(a, b, c, d)`; a point is on the inside half-space iff
//! `a*x + b*y + c*z + d >= 0`.

use crate::aabb::Aabb;
use crate::matrix::Mat4;
use crate::vector::{dot4, vec4f, Vec4f32};

#[derive(Debug, Clone, Copy)]
pub struct Frustum {
    planes: [Vec4f32; 6],
}

impl Frustum {
    pub fn from_view_proj(m: &Mat4) -> Self {
        let r0 = m.rows[0];
        let r1 = m.rows[1];
        let r2 = m.rows[2];
        let r3 = m.rows[3];
        let planes = [
            normalize(r3 + r0), // left
            normalize(r3 - r0), // right
            normalize(r3 + r1), // bottom
            normalize(r3 - r1), // top
            normalize(r3 + r2), // near
            normalize(r3 - r2), // far
        ];
        Self { planes }
    }

    /// True iff all 8 corners of `b` lie outside the same plane: the box
    /// is entirely outside the view volume and can be skipped.
    pub fn is_cullable(&self, b: &Aabb) -> bool {
        let corners = b.corners();
        self.planes.iter().any(|plane| {
            corners.iter().all(|&c| {
                let p = vec4f(c.0, c.1, c.2, 1.0);
                dot4(*plane, p) < 0.0
            })
        })
    }

    /// Projects `b`'s two space diagonals into NDC and returns the larger
    /// squared length, for comparison against a projection threshold τ.
    pub fn projected_diagonal_sq(&self, m: &Mat4, b: &Aabb) -> f32 {
        let corners = b.corners();
        let ndc = |idx: usize| -> (f32, f32) {
            let clip = m.transform_point(corners[idx]);
            let w = if clip.3.abs() > f32::EPSILON { clip.3 } else { f32::EPSILON };
            (clip.0 / w, clip.1 / w)
        };
        let diag_sq = |a: usize, b: usize| -> f32 {
            let (ax, ay) = ndc(a);
            let (bx, by) = ndc(b);
            (ax - bx) * (ax - bx) + (ay - by) * (ay - by)
        };
        // corners() is octant-ordered: 0 = (min,min,min), 7 = (max,max,max);
        // 1 and 6 are the other space diagonal's endpoints.
        diag_sq(0, 7).max(diag_sq(1, 6))
    }

    /// True iff `b`'s projected diagonal is small enough to draw rather
    /// than branch. Ties at exactly τ count as renderable, matching the
    /// spec's explicit tie-break (a node sitting right at τ is kept, not
    /// subdivided further).
    pub fn is_renderable(&self, m: &Mat4, b: &Aabb, tau: f32) -> bool {
        self.projected_diagonal_sq(m, b) <= tau
    }
}

fn normalize(p: Vec4f32) -> Vec4f32 {
    let len = (p.0 * p.0 + p.1 * p.1 + p.2 * p.2).sqrt();
    if len <= f32::EPSILON {
        return p;
    }
    vec4f(p.0 / len, p.1 / len, p.2 / len, p.3 / len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::vec3f;

    /// A simple orthographic-ish projection: clip space is world space
    /// scaled by `half_extent` so the cube `[-half_extent, half_extent]^3`
    /// maps to `[-1, 1]^3`, with `w` always 1.
    fn ortho(half_extent: f32) -> Mat4 {
        let s = 1.0 / half_extent;
        Mat4::from_rows([
            vec4f(s, 0.0, 0.0, 0.0),
            vec4f(0.0, s, 0.0, 0.0),
            vec4f(0.0, 0.0, s, 0.0),
            vec4f(0.0, 0.0, 0.0, 1.0),
        ])
    }

    #[test]
    fn box_inside_view_volume_is_not_cullable() {
        let m = ortho(10.0);
        let f = Frustum::from_view_proj(&m);
        let b = Aabb::new(vec3f(-1.0, -1.0, -1.0), vec3f(1.0, 1.0, 1.0));
        assert!(!f.is_cullable(&b));
    }

    #[test]
    fn box_far_outside_view_volume_is_cullable() {
        let m = ortho(10.0);
        let f = Frustum::from_view_proj(&m);
        let b = Aabb::new(vec3f(100.0, 100.0, 100.0), vec3f(101.0, 101.0, 101.0));
        assert!(f.is_cullable(&b));
    }

    #[test]
    fn smaller_box_has_smaller_projected_diagonal() {
        let m = ortho(10.0);
        let f = Frustum::from_view_proj(&m);
        let small = Aabb::new(vec3f(-0.1, -0.1, -0.1), vec3f(0.1, 0.1, 0.1));
        let big = Aabb::new(vec3f(-5.0, -5.0, -5.0), vec3f(5.0, 5.0, 5.0));
        assert!(f.projected_diagonal_sq(&m, &small) < f.projected_diagonal_sq(&m, &big));
    }

    #[test]
    fn diagonal_exactly_at_threshold_is_renderable() {
        let m = ortho(10.0);
        let f = Frustum::from_view_proj(&m);
        let b = Aabb::new(vec3f(-1.0, -1.0, -1.0), vec3f(1.0, 1.0, 1.0));
        let tau = f.projected_diagonal_sq(&m, &b);
        assert!(f.is_renderable(&m, &b, tau));
    }
}
