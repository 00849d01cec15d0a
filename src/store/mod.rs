//! Sibling-group store: the persistent `morton -> node` map, split
//! between a hot in-memory cache and a cold on-disk blob container.
//!
//! A node is never resident without its whole sibling group (whole-group
//! residency), a clean resident node's on-disk copy always matches its
//! in-memory copy (durable-if-clean), and `put`/`release` on one group
//! are serialized through a per-group lock so concurrent builder workers
//! touching different parents never contend (one lock per group, not a
//! global lock).

pub mod cold;
pub mod format;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crossbeam_channel::{unbounded, Sender};

use crate::error::{OctError, Result};
use crate::memory::{Evictor, MemoryGovernor};
use crate::morton::{MortonBits, MortonCode};
use crate::node::Node;
use crate::point::AttributeSet;
use cold::ColdStore;
use format::{deserialize_group, serialize_group};

/// Key under which the root's single-node "group" is stored: the root has
/// no parent, so it cannot be keyed by a real parent morton the way every
/// other group is.
pub(crate) const ROOT_GROUP_KEY: u64 = u64::MAX;

fn group_key_for<M: MortonCode>(m: M) -> u64 {
    m.parent().map(|p| p.bits()).unwrap_or(ROOT_GROUP_KEY)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LoadState {
    Loading,
    Ready,
    Failed,
}

struct GroupEntry<M: MortonCode> {
    nodes: Vec<Node<M>>,
    bytes: u64,
    /// True while any front entry (or a pending builder operation) needs
    /// this group resident; pinned groups are never chosen for eviction.
    pinned: bool,
}

struct Hot<M: MortonCode> {
    groups: HashMap<u64, GroupEntry<M>>,
    node_index: HashMap<u64, u64>,
}

pub struct SiblingGroupStore<M: MortonCode> {
    hot: Mutex<Hot<M>>,
    cold: Mutex<ColdStore>,
    governor: Arc<MemoryGovernor>,
    group_locks: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
    pending: Mutex<HashMap<u64, Arc<(Mutex<LoadState>, Condvar)>>>,
    lru: Mutex<VecDeque<u64>>,
    layout: AttributeSet,
    prefetch_tx: Sender<u64>,
}

impl<M: MortonCode> SiblingGroupStore<M> {
    /// Opens the cold blob file at `cold_path`, replaying it to rebuild
    /// the directory, and starts `workers` background prefetch threads.
    /// Registers itself as the memory governor's evictor.
    pub fn open(
        cold_path: impl Into<std::path::PathBuf>,
        governor: Arc<MemoryGovernor>,
        layout: AttributeSet,
        workers: usize,
    ) -> Result<Arc<Self>> {
        let cold = ColdStore::open(cold_path)?;
        let (prefetch_tx, prefetch_rx) = unbounded::<u64>();
        let store = Arc::new(Self {
            hot: Mutex::new(Hot {
                groups: HashMap::new(),
                node_index: HashMap::new(),
            }),
            cold: Mutex::new(cold),
            governor: Arc::clone(&governor),
            group_locks: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            lru: Mutex::new(VecDeque::new()),
            layout,
            prefetch_tx,
        });
        governor.set_evictor(Arc::clone(&store) as Arc<dyn Evictor>);

        for i in 0..workers.max(1) {
            let worker_store = Arc::clone(&store);
            let rx = prefetch_rx.clone();
            std::thread::Builder::new()
                .name(format!("octlod-prefetch-{i}"))
                .spawn(move || {
                    while let Ok(key) = rx.recv() {
                        if let Err(e) = worker_store.load_group_blocking(key) {
                            log::warn!("prefetch of group {key:#x} failed: {e}");
                        }
                    }
                })
                .expect("failed to spawn prefetch worker");
        }

        Ok(store)
    }

    fn group_lock(&self, key: u64) -> Arc<Mutex<()>> {
        let mut locks = self.group_locks.lock().unwrap();
        Arc::clone(locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    fn hot_contains_group(&self, key: u64) -> bool {
        self.hot.lock().unwrap().groups.contains_key(&key)
    }

    /// Ensures `key`'s sibling group is resident, loading it from the
    /// cold store if needed. Concurrent callers for the same key wait on
    /// the in-flight load rather than each issuing their own. Returns
    /// `false` if the key has no group in either tier.
    fn load_group_blocking(&self, key: u64) -> Result<bool> {
        if self.hot_contains_group(key) {
            return Ok(true);
        }
        let (handle, am_loader) = {
            let mut pending = self.pending.lock().unwrap();
            if let Some(h) = pending.get(&key) {
                (Arc::clone(h), false)
            } else {
                let h = Arc::new((Mutex::new(LoadState::Loading), Condvar::new()));
                pending.insert(key, Arc::clone(&h));
                (h, true)
            }
        };

        if am_loader {
            let result = self.do_load(key);
            let (lock, cv) = &*handle;
            let mut state = lock.lock().unwrap();
            *state = match &result {
                Ok(_) => LoadState::Ready,
                Err(_) => LoadState::Failed,
            };
            cv.notify_all();
            drop(state);
            self.pending.lock().unwrap().remove(&key);
            return result;
        }

        let (lock, cv) = &*handle;
        let mut state = lock.lock().unwrap();
        while *state == LoadState::Loading {
            state = cv.wait(state).unwrap();
        }
        match *state {
            LoadState::Ready => Ok(self.hot_contains_group(key)),
            LoadState::Failed => Err(OctError::StoreIO {
                parent: MortonBits(key),
                source: std::io::Error::new(std::io::ErrorKind::Other, "concurrent load failed"),
            }),
            LoadState::Loading => unreachable!(),
        }
    }

    fn do_load(&self, key: u64) -> Result<bool> {
        let blob = {
            let mut cold = self.cold.lock().unwrap();
            cold.load(key)?
        };
        let Some(blob) = blob else {
            return Ok(false);
        };
        let (_parent, _mask, mut nodes) = deserialize_group::<M>(&blob, self.layout)?;
        {
            let cold = self.cold.lock().unwrap();
            for node in nodes.iter_mut() {
                let child_mask = cold
                    .child_mortons(node.morton.bits())
                    .iter()
                    .fold(0u8, |mask, &child| mask | (1 << (child & 7)));
                node.children_mask = child_mask;
                node.dirty = false;
            }
        }
        let bytes: u64 = nodes.iter().map(|n| n.resident_bytes() as u64).sum();
        self.governor.alloc(bytes)?;
        {
            let mut hot = self.hot.lock().unwrap();
            for n in &nodes {
                hot.node_index.insert(n.morton.bits(), key);
            }
            hot.groups.insert(
                key,
                GroupEntry {
                    nodes,
                    bytes,
                    pinned: false,
                },
            );
        }
        self.lru.lock().unwrap().push_back(key);
        Ok(true)
    }

    /// Returns the node addressed by `m`, synchronously loading its
    /// sibling group if it is not already resident.
    pub fn get(&self, m: M) -> Result<Node<M>> {
        let key = group_key_for(m);
        {
            let hot = self.hot.lock().unwrap();
            if let Some(&group_key) = hot.node_index.get(&m.bits()) {
                if let Some(entry) = hot.groups.get(&group_key) {
                    if let Some(node) = entry.nodes.iter().find(|n| n.morton.bits() == m.bits()) {
                        return Ok(node.clone());
                    }
                }
            }
        }
        let found = self.load_group_blocking(key)?;
        if !found {
            return Err(OctError::NotFound(MortonBits(m.bits())));
        }
        let hot = self.hot.lock().unwrap();
        hot.node_index
            .get(&m.bits())
            .and_then(|group_key| hot.groups.get(group_key))
            .and_then(|entry| entry.nodes.iter().find(|n| n.morton.bits() == m.bits()))
            .cloned()
            .ok_or(OctError::NotFound(MortonBits(m.bits())))
    }

    /// Enqueues an asynchronous load of `m`'s sibling group. Enqueue-and-
    /// forget: failures are logged, never propagated to the caller.
    pub fn prefetch(&self, m: M) {
        let key = group_key_for(m);
        if self.hot_contains_group(key) {
            return;
        }
        let _ = self.prefetch_tx.send(key);
    }

    /// Updates (or inserts) a single node, marking it dirty. Serialized
    /// with any other `put`/`release` on the same group.
    pub fn put(&self, m: M, mut node: Node<M>) -> Result<()> {
        let key = group_key_for(m);
        let lock = self.group_lock(key);
        let _guard = lock.lock().unwrap();
        node.dirty = true;
        let (delta_alloc, delta_release, is_new_group) = {
            let mut hot = self.hot.lock().unwrap();
            let is_new_group = !hot.groups.contains_key(&key);
            let entry = hot.groups.entry(key).or_insert_with(|| GroupEntry {
                nodes: Vec::new(),
                bytes: 0,
                pinned: false,
            });
            let mut delta_alloc = 0u64;
            let mut delta_release = 0u64;
            if let Some(existing) = entry.nodes.iter_mut().find(|n| n.morton.bits() == m.bits()) {
                let old = existing.resident_bytes() as u64;
                *existing = node;
                let new = existing.resident_bytes() as u64;
                if new >= old {
                    delta_alloc = new - old;
                } else {
                    delta_release = old - new;
                }
                entry.bytes = entry.bytes + delta_alloc - delta_release;
            } else {
                let new = node.resident_bytes() as u64;
                hot.node_index.insert(m.bits(), key);
                entry.nodes.push(node);
                entry.bytes += new;
                delta_alloc = new;
            }
            (delta_alloc, delta_release, is_new_group)
        };
        if delta_alloc > 0 {
            self.governor.alloc(delta_alloc)?;
        }
        if delta_release > 0 {
            self.governor.release(delta_release);
        }
        if is_new_group {
            self.lru.lock().unwrap().push_back(key);
        }
        Ok(())
    }

    /// Publishes a complete, freshly-built sibling group in one step
    /// (used by the builder once all of a parent's children are
    /// present). All nodes must already carry `dirty == true`.
    pub fn insert_group(&self, key: u64, nodes: Vec<Node<M>>) -> Result<()> {
        let lock = self.group_lock(key);
        let _guard = lock.lock().unwrap();
        let bytes: u64 = nodes.iter().map(|n| n.resident_bytes() as u64).sum();
        self.governor.alloc(bytes)?;
        {
            let mut hot = self.hot.lock().unwrap();
            for n in &nodes {
                hot.node_index.insert(n.morton.bits(), key);
            }
            hot.groups.insert(
                key,
                GroupEntry {
                    nodes,
                    bytes,
                    pinned: false,
                },
            );
        }
        self.lru.lock().unwrap().push_back(key);
        Ok(())
    }

    /// Persists `key`'s sibling group if dirty, then evicts it from the
    /// hot cache and gives its bytes back to the memory governor. A
    /// no-op if the group is not currently resident.
    pub fn release(&self, key: u64) -> Result<()> {
        let freed = self.evict_internal(key)?;
        if freed > 0 {
            self.governor.release(freed);
        }
        Ok(())
    }

    /// Same as [`Self::release`] but does not touch the memory governor:
    /// the governor itself calls this (via [`Evictor::evict_one`]) and
    /// performs its own bookkeeping on the returned byte count, so a
    /// caller-facing `release` must not double-account.
    fn evict_internal(&self, key: u64) -> Result<u64> {
        let group_lock = self.group_lock(key);
        let _guard = group_lock.lock().unwrap();

        let group = {
            let mut hot = self.hot.lock().unwrap();
            let Some(group) = hot.groups.remove(&key) else {
                return Ok(0);
            };
            for n in &group.nodes {
                hot.node_index.remove(&n.morton.bits());
            }
            group
        };

        if group.nodes.iter().any(|n| n.dirty) {
            let parent = M::from_bits(key)?;
            let blob = serialize_group(parent, &group.nodes, self.layout);
            let child_mortons: Vec<u64> = group.nodes.iter().map(|n| n.morton.bits()).collect();
            let mut attempts = 0;
            loop {
                let result = {
                    let mut cold = self.cold.lock().unwrap();
                    cold.append(key, child_mortons.clone(), &blob)
                };
                match result {
                    Ok(()) => break,
                    Err(e) => {
                        attempts += 1;
                        if attempts >= 2 {
                            return Err(e);
                        }
                    }
                }
            }
        }

        let mut lru = self.lru.lock().unwrap();
        if let Some(pos) = lru.iter().position(|&k| k == key) {
            lru.remove(pos);
        }
        Ok(group.bytes)
    }

    /// Marks (or unmarks) `m`'s sibling group as needed by the front, so
    /// the memory governor's LRU sweep never evicts a group a live
    /// traversal depends on.
    pub fn set_pinned(&self, m: M, pinned: bool) {
        let key = group_key_for(m);
        let mut hot = self.hot.lock().unwrap();
        if let Some(entry) = hot.groups.get_mut(&key) {
            entry.pinned = pinned;
        }
    }

    pub fn resident(&self, m: M) -> bool {
        self.hot.lock().unwrap().node_index.contains_key(&m.bits())
    }

    /// Ordered, duplicate-free mortons in `[lo, hi]`, consulting both the
    /// hot cache and the cold store's child index (without paging
    /// anything in just to answer the query).
    pub fn range(&self, lo: M, hi: M) -> Vec<M> {
        let (lo_bits, hi_bits) = (lo.bits(), hi.bits());
        let mut seen = BTreeSet::new();
        {
            let hot = self.hot.lock().unwrap();
            for &bits in hot.node_index.keys() {
                if bits >= lo_bits && bits <= hi_bits {
                    seen.insert(bits);
                }
            }
        }
        {
            let cold = self.cold.lock().unwrap();
            for key in cold.keys() {
                for &child in cold.child_mortons(key) {
                    if child >= lo_bits && child <= hi_bits {
                        seen.insert(child);
                    }
                }
            }
        }
        seen.into_iter().map(|bits| M::from_bits(bits).expect("store key has valid width")).collect()
    }
}

impl<M: MortonCode> Evictor for SiblingGroupStore<M> {
    fn evict_one(&self) -> u64 {
        loop {
            let key = { self.lru.lock().unwrap().pop_front() };
            let Some(key) = key else {
                return 0;
            };
            let pinned_or_absent = {
                let hot = self.hot.lock().unwrap();
                match hot.groups.get(&key) {
                    None => true,
                    Some(g) => g.pinned,
                }
            };
            if pinned_or_absent {
                if !self.hot_contains_group(key) {
                    continue;
                }
                // pinned: put it back at the tail and stop this sweep
                // rather than spin forever over an all-pinned cache.
                self.lru.lock().unwrap().push_back(key);
                return 0;
            }
            match self.evict_internal(key) {
                Ok(freed) if freed > 0 => return freed,
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("eviction of group {key:#x} failed: {e}");
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morton::MortonMedium;
    use crate::vector::vec3f;
    use crate::point::Point;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("octlod-store-test-{}-{name}", std::process::id()))
    }

    #[test]
    fn insert_group_then_get_roundtrips() {
        let path = tmp_path("insert-get");
        let governor = MemoryGovernor::new(1 << 20);
        let store = SiblingGroupStore::<MortonMedium>::open(&path, governor, AttributeSet::POS_NORMAL_COLOR, 1).unwrap();
        let parent = MortonMedium::root();
        let child = parent.child(3).unwrap();
        let node = Node::new_leaf(child, vec![Point::new(vec3f(1.0, 2.0, 3.0))]);
        store.insert_group(parent.bits(), vec![node.clone()]).unwrap();
        let got = store.get(child).unwrap();
        assert_eq!(got.morton, child);
        assert_eq!(got.samples, node.samples);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn release_then_get_returns_equal_node_set() {
        let path = tmp_path("release-get");
        let governor = MemoryGovernor::new(1 << 20);
        let store = SiblingGroupStore::<MortonMedium>::open(&path, governor, AttributeSet::POS_NORMAL_COLOR, 1).unwrap();
        let parent = MortonMedium::root();
        let child = parent.child(2).unwrap();
        let node = Node::new_leaf(child, vec![Point::new(vec3f(4.0, 5.0, 6.0))]);
        store.insert_group(parent.bits(), vec![node.clone()]).unwrap();
        store.release(parent.bits()).unwrap();
        assert!(!store.resident(child));
        let got = store.get(child).unwrap();
        assert_eq!(got.samples, node.samples);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_key_is_not_found() {
        let path = tmp_path("missing");
        let governor = MemoryGovernor::new(1 << 20);
        let store = SiblingGroupStore::<MortonMedium>::open(&path, governor, AttributeSet::POS, 1).unwrap();
        let code = MortonMedium::root().child(1).unwrap();
        assert!(matches!(store.get(code), Err(OctError::NotFound(_))));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn pinned_group_is_not_evicted() {
        let path = tmp_path("pinned");
        let governor = MemoryGovernor::new(1 << 20);
        let store = SiblingGroupStore::<MortonMedium>::open(&path, governor, AttributeSet::POS, 1).unwrap();
        let parent = MortonMedium::root();
        let child = parent.child(0).unwrap();
        store.insert_group(parent.bits(), vec![Node::new_leaf(child, vec![Point::new(vec3f(0.0, 0.0, 0.0))])]).unwrap();
        store.set_pinned(child, true);
        assert_eq!(store.evict_one(), 0);
        assert!(store.resident(child));
        let _ = std::fs::remove_file(&path);
    }
}
