//! Traversal driver: walks the stored hierarchy against a per-frame
//! view-projection matrix, keeping [`Front`] in sync with what is
//! actually visible and handing point batches to a [`Renderer`].
//!
//! The driver never touches a rendering API directly — `Renderer` is the
//! seam a GPU layer would sit behind, kept out of this crate entirely:
//! rasterization and shading are someone else's problem.

use std::time::Instant;

use crate::dims::OctreeDim;
use crate::error::Result;
use crate::front::Front;
use crate::frustum::Frustum;
use crate::matrix::Mat4;
use crate::morton::MortonCode;
use crate::node::Node;
use crate::point::Point;
use crate::store::SiblingGroupStore;

/// Receives the point batches a frame wants drawn. `setup_frame` and
/// `end_frame` bracket each call to [`TraversalDriver::update`].
pub trait Renderer {
    fn setup_frame(&mut self, view_proj: &Mat4);
    fn emit(&mut self, points: &[Point]);
    fn end_frame(&mut self);
}

pub struct TraversalDriver<M: MortonCode> {
    dim: OctreeDim,
    front: Front<M>,
}

impl<M: MortonCode> TraversalDriver<M> {
    pub fn new(dim: OctreeDim) -> Self {
        Self {
            dim,
            front: Front::new(),
        }
    }

    pub fn front(&self) -> &Front<M> {
        &self.front
    }

    /// Builds the front from scratch with a depth-first descent from the
    /// root, used for the first frame (or after a hard camera cut).
    pub fn initial_traversal(&mut self, store: &SiblingGroupStore<M>, view_proj: &Mat4, tau: f32) -> Result<()> {
        self.front = Front::new();
        let frustum = Frustum::from_view_proj(view_proj);
        self.visit(store, &frustum, view_proj, tau, M::root())
    }

    fn visit(&mut self, store: &SiblingGroupStore<M>, frustum: &Frustum, view_proj: &Mat4, tau: f32, code: M) -> Result<()> {
        let aabb = self.dim.aabb_of(code);
        if frustum.is_cullable(&aabb) {
            // still recorded in the front (F3: resident sibling group),
            // just not emitted or descended into this frame.
            store.get(code)?;
            self.front.insert(code);
            store.set_pinned(code, true);
            return Ok(());
        }
        let node = store.get(code)?;
        if node.is_leaf() || frustum.is_renderable(view_proj, &aabb, tau) {
            self.front.insert(code);
            store.set_pinned(code, true);
            return Ok(());
        }
        for octant in 0u8..8 {
            if node.has_child(octant) {
                self.visit(store, frustum, view_proj, tau, code.child(octant)?)?;
            }
        }
        Ok(())
    }

    /// Incrementally updates the front for one frame: cull nodes that
    /// left the view volume, branch nodes that grew too large to draw as
    /// one, prune sibling groups that shrank small enough to collapse
    /// into their parent, and emit whatever remains. `deadline`, if set,
    /// stops walking the front (leaving any untouched entries exactly as
    /// they were) once it passes — a node left mid-update this frame is
    /// simply revisited next frame, never a correctness issue.
    pub fn update<R: Renderer>(&mut self, store: &SiblingGroupStore<M>, view_proj: &Mat4, tau: f32, deadline: Option<Instant>, renderer: &mut R) -> Result<()> {
        renderer.setup_frame(view_proj);
        let frustum = Frustum::from_view_proj(view_proj);
        let current: Vec<M> = self.front.iter().collect();

        for code in current {
            if let Some(dl) = deadline {
                if Instant::now() >= dl {
                    break;
                }
            }
            if !self.front.contains(code) {
                // already folded away by an earlier prune/branch this frame
                continue;
            }
            let aabb = self.dim.aabb_of(code);
            if frustum.is_cullable(&aabb) {
                // stays in the front (still resident, still tracked so it
                // can come back into view), simply not emitted this frame.
                continue;
            }
            let node = store.get(code)?;
            if !node.is_leaf() && !frustum.is_renderable(view_proj, &aabb, tau) {
                self.branch(store, code, &node)?;
                continue;
            }
            if let Some(parent) = code.parent() {
                let parent_aabb = self.dim.aabb_of(parent);
                if frustum.is_renderable(view_proj, &parent_aabb, tau) || frustum.is_cullable(&parent_aabb) {
                    let parent_node = store.get(parent)?;
                    if self.front.all_siblings_present(code, parent_node.children_mask) {
                        self.prune(store, parent, &parent_node);
                        continue;
                    }
                }
            }
            // otherwise: kept exactly as it was
        }

        for code in self.front.iter() {
            let aabb = self.dim.aabb_of(code);
            if frustum.is_cullable(&aabb) {
                continue;
            }
            let node = store.get(code)?;
            // a child just inserted by this frame's own branch() may still
            // be too coarse to draw (it only gets a chance to branch again
            // next frame); only leaves and renderable nodes are emitted.
            if node.is_leaf() || frustum.is_renderable(view_proj, &aabb, tau) {
                renderer.emit(&node.samples);
            }
        }
        renderer.end_frame();
        Ok(())
    }

    fn branch(&mut self, store: &SiblingGroupStore<M>, code: M, node: &Node<M>) -> Result<()> {
        self.front.remove(code);
        store.set_pinned(code, false);
        for octant in 0u8..8 {
            if node.has_child(octant) {
                let child = code.child(octant)?;
                self.front.insert(child);
                store.set_pinned(child, true);
            }
        }
        Ok(())
    }

    fn prune(&mut self, store: &SiblingGroupStore<M>, parent: M, parent_node: &Node<M>) {
        for octant in 0u8..8 {
            if parent_node.has_child(octant) {
                if let Ok(child) = parent.child(octant) {
                    if self.front.remove(child) {
                        store.set_pinned(child, false);
                    }
                }
            }
        }
        self.front.insert(parent);
        store.set_pinned(parent, true);
    }
}
