//! Octree node: a Morton code, a bounded sample array, and a
//! child-presence bitmask. Leaf vs. inner is not a separate type —
//! `is_leaf() == (children_mask == 0)`, per the design note on
//! polymorphic nodes.

use rand::seq::index::sample;
use rand::SeedableRng;
use rand_pcg::Pcg32;

use crate::morton::MortonCode;
use crate::point::Point;

#[derive(Debug, Clone)]
pub struct Node<M: MortonCode> {
    pub morton: M,
    pub samples: Vec<Point>,
    /// Bit `i` set iff the `i`-th child (octant `i`) exists.
    pub children_mask: u8,
    /// Set whenever this node has mutations not yet reflected on disk.
    pub dirty: bool,
}

impl<M: MortonCode> Node<M> {
    pub fn new_leaf(morton: M, samples: Vec<Point>) -> Self {
        Self {
            morton,
            samples,
            children_mask: 0,
            dirty: true,
        }
    }

    pub fn new_inner(morton: M, samples: Vec<Point>, children_mask: u8) -> Self {
        Self {
            morton,
            samples,
            children_mask,
            dirty: true,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children_mask == 0
    }

    pub fn has_child(&self, octant: u8) -> bool {
        self.children_mask & (1 << octant) != 0
    }

    pub fn child_count(&self) -> u32 {
        self.children_mask.count_ones()
    }

    /// Heap size estimate used by the memory governor: the node struct
    /// plus its owned sample array.
    pub fn resident_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.samples.len() * std::mem::size_of::<Point>()
    }
}

/// Builds an inner node's sample array from the concatenation of its
/// children's samples: `k = clamp(1, floor(sum / 8), cap)` indices picked
/// without replacement, using a PRNG seeded from `morton`'s bits so the
/// selection is reproducible regardless of build thread scheduling.
pub fn sample_inner_node<M: MortonCode>(morton: M, children_samples: &[Point], cap: usize) -> Vec<Point> {
    let total = children_samples.len();
    if total == 0 {
        return Vec::new();
    }
    let k = (total / 8).clamp(1, cap.max(1)).min(total);
    let mut rng = Pcg32::seed_from_u64(morton.bits());
    sample(&mut rng, total, k)
        .into_iter()
        .map(|i| children_samples[i])
        .collect()
}

/// Truncates a leaf's sample array to `cap` by uniform random downsampling,
/// seeded by the leaf's own morton so the kept subset is reproducible.
/// A leaf at or under `cap` is returned unchanged.
pub fn truncate_leaf_samples<M: MortonCode>(morton: M, samples: Vec<Point>, cap: usize) -> Vec<Point> {
    if samples.len() <= cap {
        return samples;
    }
    let mut rng = Pcg32::seed_from_u64(morton.bits());
    sample(&mut rng, samples.len(), cap)
        .into_iter()
        .map(|i| samples[i])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morton::MortonMedium;
    use crate::vector::vec3f;

    fn pt(x: f32) -> Point {
        Point::new(vec3f(x, 0.0, 0.0))
    }

    #[test]
    fn sample_count_is_clamped_between_one_and_cap() {
        let morton = MortonMedium::root().child(0).unwrap();
        let few: Vec<Point> = (0..3).map(|i| pt(i as f32)).collect();
        assert_eq!(sample_inner_node(morton, &few, 16).len(), 1);

        let many: Vec<Point> = (0..100).map(|i| pt(i as f32)).collect();
        let sampled = sample_inner_node(morton, &many, 4);
        assert_eq!(sampled.len(), 4);

        let cap_above_total: Vec<Point> = (0..6).map(|i| pt(i as f32)).collect();
        // sum/8 = 0 -> clamped to 1, never exceeds total
        assert_eq!(sample_inner_node(morton, &cap_above_total, 16).len(), 1);
    }

    #[test]
    fn same_morton_and_input_reproduces_identical_sample() {
        let morton = MortonMedium::root().child(3).unwrap();
        let children: Vec<Point> = (0..64).map(|i| pt(i as f32)).collect();
        let a = sample_inner_node(morton, &children, 8);
        let b = sample_inner_node(morton, &children, 8);
        assert_eq!(a, b);
    }

    #[test]
    fn different_morton_can_select_a_different_sample() {
        let children: Vec<Point> = (0..64).map(|i| pt(i as f32)).collect();
        let a = sample_inner_node(MortonMedium::root().child(0).unwrap(), &children, 8);
        let b = sample_inner_node(MortonMedium::root().child(1).unwrap(), &children, 8);
        assert_ne!(a, b);
    }

    #[test]
    fn truncate_leaf_samples_is_a_no_op_under_cap() {
        let morton = MortonMedium::root().child(2).unwrap();
        let few: Vec<Point> = (0..3).map(|i| pt(i as f32)).collect();
        assert_eq!(truncate_leaf_samples(morton, few.clone(), 8), few);
    }

    #[test]
    fn truncate_leaf_samples_downsamples_reproducibly() {
        let morton = MortonMedium::root().child(5).unwrap();
        let many: Vec<Point> = (0..50).map(|i| pt(i as f32)).collect();
        let a = truncate_leaf_samples(morton, many.clone(), 10);
        let b = truncate_leaf_samples(morton, many, 10);
        assert_eq!(a.len(), 10);
        assert_eq!(a, b);
    }

    #[test]
    fn is_leaf_iff_children_mask_is_zero() {
        let morton = MortonMedium::root();
        let leaf = Node::new_leaf(morton, vec![pt(0.0)]);
        assert!(leaf.is_leaf());
        let inner = Node::new_inner(morton, vec![pt(0.0)], 0b0000_0011);
        assert!(!inner.is_leaf());
        assert_eq!(inner.child_count(), 2);
        assert!(inner.has_child(0));
        assert!(inner.has_child(1));
        assert!(!inner.has_child(2));
    }
}
