//! Parallel bottom-up hierarchy builder.
//!
//! Construction proceeds in two kinds of passes over a Morton-sorted
//! point stream: a cheap sequential scan establishes disjoint contiguous
//! runs of sibling groups, then the expensive per-run work happens on a
//! rayon thread pool.
//!
//! Stage 1 groups the sorted stream directly by leaf parent: since the
//! stream is globally sorted, every leaf sharing a parent is contiguous,
//! and a parent's children can only straddle a chunk boundary at the
//! chunk's own edges, never in its interior. Stage 2 repeats the same
//! contiguous-run grouping one level at a time, bottom-up, until the
//! root's own "group" (keyed by [`store::ROOT_GROUP_KEY`]) is published.
//!
//! Progress is checkpointed to a small JSON sidecar after each completed
//! stage so an interrupted build can resume from the last finished level
//! instead of re-reading the whole point stream.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{OctError, Result};
use crate::morton::MortonCode;
use crate::node::{sample_inner_node, truncate_leaf_samples, Node};
use crate::point::Point;
use crate::store::{SiblingGroupStore, ROOT_GROUP_KEY};

/// Cooperative cancel signal, checked at each work-item boundary during
/// construction. Cloning shares the same underlying flag, so a caller can
/// hold one end and call [`CancelToken::cancel`] from another thread (a
/// signal handler, a UI "stop" button) while the build runs.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BuildConfig {
    /// Points per stage-1 batch; bounds how much of the sorted stream is
    /// held in memory at once before it is folded into leaf groups.
    pub work_item: usize,
    /// Cap passed to [`sample_inner_node`] for every inner node built.
    pub inner_cap: usize,
    /// Per-leaf sample cap `M`; leaves over this are downsampled.
    pub leaf_cap: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            work_item: 4096,
            inner_cap: 4096,
            leaf_cap: 4096,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ResumeState {
    /// `(morton_bits, children_mask)` for every node at the frontier
    /// level not yet folded into its own parent's group.
    frontier: Vec<(u64, u8)>,
}

/// Builds (or resumes building) the octree for an already Morton-sorted
/// point stream, persisting sibling groups into `store` as they complete.
/// `cancel` is checked between stages; on cancellation, every group
/// published so far stays durable (it was already flushed to `store`)
/// and `build` returns `Err(OctError::Cancelled)` with the frontier
/// checkpointed so a later call resumes from where this one stopped.
pub fn build<M: MortonCode>(
    points: impl Iterator<Item = Result<(M, Point)>>,
    store: &SiblingGroupStore<M>,
    progress_path: &Path,
    cfg: &BuildConfig,
    cancel: &CancelToken,
) -> Result<()> {
    if store.get(M::root()).is_ok() {
        log::info!("root already resident, build is a no-op");
        return Ok(());
    }

    let mut frontier = match load_progress(progress_path)? {
        Some(saved) => {
            log::info!("resuming build from a saved frontier of {} node(s)", saved.len());
            saved.into_iter().map(|(bits, mask)| Ok((M::from_bits(bits)?, mask))).collect::<Result<Vec<_>>>()?
        }
        None => {
            let frontier = assemble_leaf_groups(points, cfg.work_item, cfg.leaf_cap, store, cancel)?;
            save_progress(progress_path, &frontier)?;
            frontier
        }
    };

    loop {
        if cancel.is_cancelled() {
            return Err(OctError::Cancelled);
        }
        let (next_frontier, root_done) = build_next_level(&frontier, store, cfg.inner_cap)?;
        if root_done {
            let _ = std::fs::remove_file(progress_path);
            return Ok(());
        }
        save_progress(progress_path, &next_frontier)?;
        frontier = next_frontier;
    }
}

/// Stage 1: folds a Morton-sorted point stream directly into leaf
/// sibling groups, keyed by each leaf's parent. Returns the resulting
/// frontier: one `(parent_code, children_mask)` pair per group created.
fn assemble_leaf_groups<M: MortonCode>(
    points: impl Iterator<Item = Result<(M, Point)>>,
    work_item: usize,
    leaf_cap: usize,
    store: &SiblingGroupStore<M>,
    cancel: &CancelToken,
) -> Result<Vec<(M, u8)>> {
    let mut batches: Vec<Vec<(M, Point)>> = Vec::new();
    let mut current = Vec::with_capacity(work_item);
    for item in points {
        current.push(item?);
        if current.len() >= work_item {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(work_item)));
            if cancel.is_cancelled() {
                return Err(OctError::Cancelled);
            }
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    if cancel.is_cancelled() {
        return Err(OctError::Cancelled);
    }

    let per_batch: Vec<Vec<(u64, Vec<Node<M>>)>> = batches.par_iter().map(|batch| group_batch_by_leaf_parent(batch)).collect();
    let merged = merge_adjacent_runs(per_batch, leaf_cap);

    let mut frontier = Vec::with_capacity(merged.len());
    for (parent_key, children) in merged {
        let mask = children_mask(&children);
        store.insert_group(parent_key, children)?;
        frontier.push((M::from_bits(parent_key)?, mask));
    }
    frontier.sort_by_key(|&(code, _)| code.bits());
    Ok(frontier)
}

/// Groups a single batch's `(morton, point)` pairs into leaf nodes, then
/// groups those contiguous leaves by shared parent code, mirroring
/// `hlbvh.rs`'s scan over morton-sorted primitives to find treelet runs
/// sharing a masked prefix.
/// Leaves are built with their raw (untruncated) sample set here; the
/// `M`-cap downsample happens once in [`merge_adjacent_runs`] after a
/// leaf split across a batch boundary has been reunited with its other
/// half, so the seeded downsample sees the leaf's complete point set.
fn group_batch_by_leaf_parent<M: MortonCode>(batch: &[(M, Point)]) -> Vec<(u64, Vec<Node<M>>)> {
    let mut runs: Vec<(u64, Vec<Node<M>>)> = Vec::new();
    let mut i = 0;
    while i < batch.len() {
        let code = batch[i].0;
        let mut j = i;
        let mut samples = Vec::new();
        while j < batch.len() && batch[j].0 == code {
            samples.push(batch[j].1);
            j += 1;
        }
        let leaf = Node::new_leaf(code, samples);
        let parent_key = code.parent().map(|p| p.bits()).unwrap_or(ROOT_GROUP_KEY);
        match runs.last_mut() {
            Some((last_key, members)) if *last_key == parent_key => members.push(leaf),
            _ => runs.push((parent_key, vec![leaf])),
        }
        i = j;
    }
    runs
}

/// Flattens per-batch run lists into one list, merging a batch's
/// trailing run into the next batch's leading run when they share a key
/// (the only place a parent's children can be split by a chunk edge). A
/// leaf itself can straddle that same edge (its own points split across
/// two batches); when the last leaf of one run and the first leaf of the
/// next share a morton, their sample vectors are reunited into one leaf
/// before the per-leaf cap is applied.
fn merge_adjacent_runs<M: MortonCode>(per_batch: Vec<Vec<(u64, Vec<Node<M>>)>>, leaf_cap: usize) -> Vec<(u64, Vec<Node<M>>)> {
    let mut merged: Vec<(u64, Vec<Node<M>>)> = Vec::new();
    for batch_runs in per_batch {
        for (key, mut children) in batch_runs {
            match merged.last_mut() {
                Some((last_key, last_children)) if *last_key == key => {
                    match (last_children.last_mut(), children.first_mut()) {
                        (Some(last_leaf), Some(first_leaf)) if last_leaf.morton == first_leaf.morton => {
                            last_leaf.samples.append(&mut first_leaf.samples);
                            children.remove(0);
                        }
                        _ => {}
                    }
                    last_children.append(&mut children);
                }
                _ => merged.push((key, children)),
            }
        }
    }
    for (_, children) in merged.iter_mut() {
        for leaf in children.iter_mut() {
            leaf.samples = truncate_leaf_samples(leaf.morton, std::mem::take(&mut leaf.samples), leaf_cap);
        }
    }
    merged
}

fn children_mask<M: MortonCode>(nodes: &[Node<M>]) -> u8 {
    nodes.iter().fold(0u8, |mask, n| mask | (1 << (n.morton.bits() & 7)))
}

/// Stage 2: builds one more level of inner nodes from `frontier`,
/// sampling each node's representative points from its already-resident
/// children, then groups the newly built nodes by their own parent and
/// publishes each resulting sibling group. Returns the next frontier and
/// whether the root's group was the one just published.
fn build_next_level<M: MortonCode>(frontier: &[(M, u8)], store: &SiblingGroupStore<M>, inner_cap: usize) -> Result<(Vec<(M, u8)>, bool)> {
    let runs = group_frontier_by_parent(frontier);
    let members: Vec<(u64, M, u8)> = runs.into_iter().flat_map(|(gp, ms)| ms.into_iter().map(move |(code, mask)| (gp, code, mask))).collect();

    let built: Vec<(u64, Node<M>)> = members
        .par_iter()
        .map(|&(gp, code, mask)| -> Result<(u64, Node<M>)> {
            let mut samples = Vec::new();
            for octant in 0u8..8 {
                if mask & (1 << octant) != 0 {
                    let child_code = code.child(octant)?;
                    let child_node = store.get(child_code)?;
                    samples.extend(child_node.samples.iter().copied());
                }
            }
            let node_samples = sample_inner_node(code, &samples, inner_cap);
            Ok((gp, Node::new_inner(code, node_samples, mask)))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut next_groups: Vec<(u64, Vec<Node<M>>)> = Vec::new();
    for (gp, node) in built {
        match next_groups.last_mut() {
            Some((last_gp, nodes)) if *last_gp == gp => nodes.push(node),
            _ => next_groups.push((gp, vec![node])),
        }
    }

    let mut root_done = false;
    let mut next_frontier = Vec::new();
    for (gp_key, nodes) in next_groups {
        for node in &nodes {
            // children folded into this node are no longer needed hot;
            // best-effort reclaim now rather than waiting on pressure.
            let _ = store.release(node.morton.bits());
        }
        let mask = children_mask(&nodes);
        store.insert_group(gp_key, nodes)?;
        if gp_key == ROOT_GROUP_KEY {
            root_done = true;
        } else {
            next_frontier.push((M::from_bits(gp_key)?, mask));
        }
    }
    next_frontier.sort_by_key(|&(code, _)| code.bits());
    Ok((next_frontier, root_done))
}

fn group_frontier_by_parent<M: MortonCode>(frontier: &[(M, u8)]) -> Vec<(u64, Vec<(M, u8)>)> {
    let mut runs: Vec<(u64, Vec<(M, u8)>)> = Vec::new();
    for &(code, mask) in frontier {
        let parent_key = code.parent().map(|p| p.bits()).unwrap_or(ROOT_GROUP_KEY);
        match runs.last_mut() {
            Some((last_key, members)) if *last_key == parent_key => members.push((code, mask)),
            _ => runs.push((parent_key, vec![(code, mask)])),
        }
    }
    runs
}

fn load_progress(path: &Path) -> Result<Option<Vec<(u64, u8)>>> {
    match std::fs::read(path) {
        Ok(bytes) => {
            let state: ResumeState = serde_json::from_slice(&bytes).map_err(|e| OctError::CorruptInput(format!("resume state: {e}")))?;
            Ok(Some(state.frontier))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(OctError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn save_progress<M: MortonCode>(path: &Path, frontier: &[(M, u8)]) -> Result<()> {
    let state = ResumeState {
        frontier: frontier.iter().map(|&(code, mask)| (code.bits(), mask)).collect(),
    };
    let bytes = serde_json::to_vec(&state).map_err(|e| OctError::CorruptInput(format!("resume state: {e}")))?;
    std::fs::write(path, bytes).map_err(|e| OctError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}
