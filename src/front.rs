//! The front: the ordered set of currently-drawn node mortons.
//!
//! Morton order is depth-first-left order, so a `BTreeSet` gives ordered
//! iteration for free — the same reasoning the store's `range` query
//! relies on. The traversal driver is the front's sole mutator and runs
//! single-threaded between frames, so no internal locking is needed here.

use std::collections::BTreeSet;
use std::marker::PhantomData;

use crate::morton::MortonCode;

#[derive(Debug)]
pub struct Front<M: MortonCode> {
    entries: BTreeSet<u64>,
    _marker: PhantomData<M>,
}

impl<M: MortonCode> Default for Front<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: MortonCode> Front<M> {
    pub fn new() -> Self {
        Self {
            entries: BTreeSet::new(),
            _marker: PhantomData,
        }
    }

    pub fn insert(&mut self, m: M) -> bool {
        self.entries.insert(m.bits())
    }

    pub fn remove(&mut self, m: M) -> bool {
        self.entries.remove(&m.bits())
    }

    pub fn contains(&self, m: M) -> bool {
        self.entries.contains(&m.bits())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates front entries in Morton (depth-first-left) order.
    pub fn iter(&self) -> impl Iterator<Item = M> + '_ {
        self.entries.iter().map(|&bits| M::from_bits(bits).expect("front entry has valid width"))
    }

    /// All of `m`'s siblings (same parent, different octant) currently
    /// resident in the front, `m` included. Empty if `m` is the root.
    pub fn siblings_in_front(&self, m: M) -> Vec<M> {
        let Some(parent) = m.parent() else {
            return vec![m];
        };
        (0u8..8)
            .filter_map(|octant| parent.child(octant).ok())
            .filter(|c| self.contains(*c))
            .collect()
    }

    /// True iff every one of `m`'s 8 possible siblings that exists at all
    /// is currently in the front. Used by the traversal driver's prune
    /// step, which only collapses a front entry into its parent once all
    /// siblings that would need collapsing are present together.
    pub fn all_siblings_present(&self, m: M, existing_octants: u8) -> bool {
        (0u8..8).all(|octant| {
            if existing_octants & (1 << octant) == 0 {
                return true;
            }
            match m.parent().and_then(|p| p.child(octant).ok()) {
                Some(sibling) => self.contains(sibling),
                None => false,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morton::MortonMedium;

    #[test]
    fn insert_remove_contains_roundtrip() {
        let mut front: Front<MortonMedium> = Front::new();
        let root = MortonMedium::root();
        assert!(!front.contains(root));
        front.insert(root);
        assert!(front.contains(root));
        front.remove(root);
        assert!(!front.contains(root));
    }

    #[test]
    fn iter_yields_morton_order() {
        let mut front: Front<MortonMedium> = Front::new();
        let root = MortonMedium::root();
        let c3 = root.child(3).unwrap();
        let c1 = root.child(1).unwrap();
        front.insert(c3);
        front.insert(c1);
        let order: Vec<MortonMedium> = front.iter().collect();
        assert_eq!(order, vec![c1, c3]);
    }

    #[test]
    fn all_siblings_present_requires_every_existing_octant() {
        let mut front: Front<MortonMedium> = Front::new();
        let root = MortonMedium::root();
        let c0 = root.child(0).unwrap();
        let c1 = root.child(1).unwrap();
        front.insert(c0);
        // only c0 present of a mask claiming both 0 and 1 exist
        assert!(!front.all_siblings_present(c0, 0b0000_0011));
        front.insert(c1);
        assert!(front.all_siblings_present(c0, 0b0000_0011));
    }
}
