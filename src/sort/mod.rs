//! Out-of-core point sorter: a two-pass, bounded-memory external sort
//! that turns an arbitrarily large point source into a stream of points
//! in ascending Morton order.
//!
//! Pass one streams every point once to find the world bounding box.
//! Pass two re-streams the points, scales each into the unit-ish cube
//! implied by that box, assigns it a Morton code at the octree's max
//! level, accumulates points into memory-bounded chunks, sorts each
//! chunk in place and spills it to a temp file, then k-way merges the
//! spilled chunks with a min-heap. This mirrors a classic chunk-sort +
//! merge external sort, split the same way across two passes (bounds,
//! then chunk-sort-and-merge).

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use rdst::{RadixKey, RadixSort};

use crate::dims::OctreeDim;
use crate::error::{OctError, Result};
use crate::morton::MortonCode;
use crate::point::{AttributeSet, Point};
use crate::vector::{vec3f, Vec3f32};

/// Bytes of one on-disk chunk record: an 8-byte Morton key, a 4-byte
/// input-order sequence number (the tie-break that keeps the sort
/// stable), then a full-layout (pos+normal+color) point.
const RECORD_LAYOUT: AttributeSet = AttributeSet::POS_NORMAL_COLOR;
const RECORD_SIZE: usize = 8 + 4 + 36;

/// A repeatable source of points: `for_each` may be called more than
/// once (the sorter calls it once for bounds, once to stream chunks) and
/// must yield the same points in the same order every time.
pub trait PointSource {
    fn for_each(&self, visit: &mut dyn FnMut(Point)) -> Result<()>;
}

impl PointSource for Vec<Point> {
    fn for_each(&self, visit: &mut dyn FnMut(Point)) -> Result<()> {
        for p in self {
            visit(*p);
        }
        Ok(())
    }
}

/// Scans `source` once and returns `(min, max, count)` over raw
/// positions, before any scaling.
pub fn compute_bounds<S: PointSource>(source: &S) -> Result<(Vec3f32, Vec3f32, u64)> {
    let mut min = vec3f(f32::MAX, f32::MAX, f32::MAX);
    let mut max = vec3f(f32::MIN, f32::MIN, f32::MIN);
    let mut count = 0u64;
    source.for_each(&mut |p| {
        min.0 = min.0.min(p.pos.0);
        min.1 = min.1.min(p.pos.1);
        min.2 = min.2.min(p.pos.2);
        max.0 = max.0.max(p.pos.0);
        max.1 = max.1.max(p.pos.1);
        max.2 = max.2.max(p.pos.2);
        count += 1;
    })?;
    Ok((min, max, count))
}

/// The uniform factor that maps a raw bounding box's longest axis to
/// `1.0`. Degenerate (zero-extent) inputs fall back to a scale of `1.0`.
pub fn compute_scale(min: Vec3f32, max: Vec3f32) -> f32 {
    let extent = max - min;
    let longest = extent.0.max(extent.1).max(extent.2);
    if longest > 0.0 {
        1.0 / longest
    } else {
        1.0
    }
}

/// Builds the octree's dimensions for the *post-scale* point stream: per
/// spec §4.D step 1, every point is rewritten to `(p - min) * scale`
/// before it is Morton-coded or written anywhere, so the dim's own
/// origin is always the zero vector and its size is the raw extent
/// scaled by the same factor.
pub fn build_dim(min: Vec3f32, max: Vec3f32, max_level: u32) -> OctreeDim {
    let scale = compute_scale(min, max);
    let extent = max - min;
    OctreeDim::new(vec3f(0.0, 0.0, 0.0), extent * scale, max_level)
}

/// `seq` is this entry's position in the input order before sorting; the
/// spec requires ties (equal morton) to preserve input order, so it rides
/// along as a tie-break low bits instead of relying on a stable sort
/// algorithm (`rdst`'s radix sort is an unstable in-place sort).
#[derive(Debug, Clone, Copy)]
struct ChunkEntry {
    morton: u64,
    seq: u32,
    point: Point,
}

impl RadixKey for ChunkEntry {
    const LEVELS: usize = 12;

    #[inline]
    fn get_level(&self, level: usize) -> u8 {
        if level < 8 {
            (self.morton >> (level * 8)) as u8
        } else {
            (self.seq >> ((level - 8) * 8)) as u8
        }
    }
}

impl PartialEq for ChunkEntry {
    fn eq(&self, other: &Self) -> bool {
        self.morton == other.morton && self.seq == other.seq
    }
}
impl Eq for ChunkEntry {}

impl PartialOrd for ChunkEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ChunkEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.morton, self.seq).cmp(&(other.morton, other.seq))
    }
}

fn sort_chunk(chunk: &mut [ChunkEntry]) {
    // rdst's radix sort relies on well-defined unsigned wraparound that
    // debug builds panic on, so debug builds take the slower stable sort.
    // Either way ties are broken by `seq`, so the visible order is always
    // stable with respect to input order regardless of algorithm.
    if cfg!(debug_assertions) {
        chunk.sort_unstable();
    } else {
        chunk.radix_sort_unstable();
    }
}

fn write_chunk(path: &Path, chunk: &[ChunkEntry]) -> Result<()> {
    let file = File::create(path).map_err(|e| io_err(path, e))?;
    let mut writer = BufWriter::new(file);
    let mut buf = Vec::with_capacity(RECORD_SIZE);
    for entry in chunk {
        buf.clear();
        buf.extend_from_slice(&entry.morton.to_le_bytes());
        buf.extend_from_slice(&entry.seq.to_le_bytes());
        entry.point.write(RECORD_LAYOUT, &mut buf);
        writer.write_all(&buf).map_err(|e| io_err(path, e))?;
    }
    writer.flush().map_err(|e| io_err(path, e))?;
    Ok(())
}

fn io_err(path: &Path, source: std::io::Error) -> OctError {
    OctError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// A single open spill file, buffered one record ahead for the merge.
struct ChunkReader {
    reader: BufReader<File>,
    path: PathBuf,
    next: Option<(u64, u32, Point)>,
}

impl ChunkReader {
    fn open(path: PathBuf) -> Result<Self> {
        let file = File::open(&path).map_err(|e| io_err(&path, e))?;
        let mut reader = ChunkReader {
            reader: BufReader::new(file),
            path,
            next: None,
        };
        reader.advance()?;
        Ok(reader)
    }

    fn advance(&mut self) -> Result<()> {
        let mut buf = [0u8; RECORD_SIZE];
        match self.reader.read_exact(&mut buf) {
            Ok(()) => {
                let morton = u64::from_le_bytes(buf[0..8].try_into().unwrap());
                let seq = u32::from_le_bytes(buf[8..12].try_into().unwrap());
                let (point, _) = Point::read(RECORD_LAYOUT, &buf[12..])?;
                self.next = Some((morton, seq, point));
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.next = None;
                Ok(())
            }
            Err(e) => Err(io_err(&self.path, e)),
        }
    }
}

/// Min-heap entry pointing at one open chunk reader by index. Ties on
/// `morton` break on `seq`, the point's original input-order position,
/// so the merged stream stays stable even across chunk boundaries.
struct HeapItem {
    morton: u64,
    seq: u32,
    chunk: usize,
}
impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.morton == other.morton && self.seq == other.seq
    }
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // std::collections::BinaryHeap is a max-heap; reverse for min-heap order.
        (other.morton, other.seq).cmp(&(self.morton, self.seq))
    }
}

/// Streams the k-way merge of a set of pre-sorted chunk files in
/// ascending Morton order, deleting each chunk file as it is exhausted.
pub struct MergeStream<M: MortonCode> {
    readers: Vec<ChunkReader>,
    heap: std::collections::BinaryHeap<HeapItem>,
    _marker: std::marker::PhantomData<M>,
}

impl<M: MortonCode> MergeStream<M> {
    fn new(paths: Vec<PathBuf>) -> Result<Self> {
        let mut readers = Vec::with_capacity(paths.len());
        let mut heap = std::collections::BinaryHeap::with_capacity(paths.len());
        for path in paths {
            let reader = ChunkReader::open(path)?;
            if let Some((morton, seq, _)) = reader.next {
                heap.push(HeapItem {
                    morton,
                    seq,
                    chunk: readers.len(),
                });
            }
            readers.push(reader);
        }
        Ok(Self {
            readers,
            heap,
            _marker: std::marker::PhantomData,
        })
    }
}

impl<M: MortonCode> Iterator for MergeStream<M> {
    type Item = Result<(M, Point)>;

    fn next(&mut self) -> Option<Self::Item> {
        let top = self.heap.pop()?;
        let reader = &mut self.readers[top.chunk];
        let (morton, _seq, point) = reader.next.take().expect("heap entry without buffered record");
        let result = match M::from_bits(morton) {
            Ok(code) => Ok((code, point)),
            Err(e) => return Some(Err(e)),
        };
        if let Err(e) = reader.advance() {
            return Some(Err(e));
        }
        if let Some((next_morton, next_seq, _)) = reader.next {
            self.heap.push(HeapItem {
                morton: next_morton,
                seq: next_seq,
                chunk: top.chunk,
            });
        } else {
            let _ = std::fs::remove_file(&reader.path);
        }
        Some(result)
    }
}

/// Bounded-memory external sorter over one octree's worth of points.
///
/// `dim` is already post-scale (origin zero, size the scaled extent);
/// `raw_origin`/`scale` are the same pair `build_dim` derived it from,
/// kept here so every point can be rewritten to `(p - raw_origin) *
/// scale` before it is Morton-coded or written to a chunk, per spec
/// §4.D step 1.
pub struct ExternalSorter {
    dim: OctreeDim,
    raw_origin: Vec3f32,
    scale: f32,
    quota: u64,
    tmp_dir: PathBuf,
}

impl ExternalSorter {
    pub fn new(dim: OctreeDim, raw_origin: Vec3f32, scale: f32, quota: u64, tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            dim,
            raw_origin,
            scale,
            quota,
            tmp_dir: tmp_dir.into(),
        }
    }

    /// Streams `source`, rewriting each point's position into the
    /// post-scale cube and Morton-coding it against `self.dim`, spills
    /// memory-bounded sorted chunks to `self.tmp_dir`, then returns a
    /// stream that yields every point in ascending Morton order without
    /// materializing the full merged result in memory. Points stored in
    /// the chunks (and therefore the final merged stream) already carry
    /// the rewritten, post-scale position.
    pub fn sort<M: MortonCode, S: PointSource>(
        &self,
        source: &S,
        total_points: u64,
    ) -> Result<MergeStream<M>> {
        let total_bytes = total_points.saturating_mul(RECORD_SIZE as u64).max(1);
        let chunks_per_merge = total_bytes.div_ceil(self.quota).max(1);
        let points_per_chunk = ((self.quota / chunks_per_merge) / RECORD_SIZE as u64).max(1) as usize;
        if points_per_chunk == 0 {
            return Err(OctError::QuotaTooSmall {
                quota: self.quota,
                record_size: RECORD_SIZE as u64,
            });
        }

        let mut chunk_paths = Vec::new();
        let mut buffer: Vec<ChunkEntry> = Vec::with_capacity(points_per_chunk);
        let mut err: Option<OctError> = None;
        let mut seq: u32 = 0;

        source.for_each(&mut |mut p| {
            if err.is_some() {
                return;
            }
            p.pos = (p.pos - self.raw_origin) * self.scale;
            match self.dim.morton_of::<M>(p.pos) {
                Ok(code) => {
                    buffer.push(ChunkEntry {
                        morton: code.bits(),
                        seq,
                        point: p,
                    });
                    seq = seq.wrapping_add(1);
                }
                Err(e) => err = Some(e),
            }
            if buffer.len() == points_per_chunk {
                if let Err(e) = self.flush_chunk(&mut buffer, &mut chunk_paths) {
                    err = Some(e);
                }
            }
        })?;
        if let Some(e) = err {
            return Err(e);
        }
        if !buffer.is_empty() {
            self.flush_chunk(&mut buffer, &mut chunk_paths)?;
        }

        MergeStream::new(chunk_paths)
    }

    fn flush_chunk(&self, buffer: &mut Vec<ChunkEntry>, chunk_paths: &mut Vec<PathBuf>) -> Result<()> {
        sort_chunk(buffer);
        let path = self.tmp_dir.join(format!("octlod-chunk-{:06}.tmp", chunk_paths.len()));
        write_chunk(&path, buffer)?;
        chunk_paths.push(path);
        buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morton::MortonMedium;

    fn point_at(x: f32, y: f32, z: f32) -> Point {
        Point::new(vec3f(x, y, z))
    }

    #[test]
    fn bounds_cover_every_point() {
        let points = vec![point_at(1.0, 2.0, 3.0), point_at(-1.0, 5.0, 0.0), point_at(0.0, 0.0, 9.0)];
        let (min, max, count) = compute_bounds(&points).unwrap();
        assert_eq!(count, 3);
        assert_eq!(min, vec3f(-1.0, 0.0, 0.0));
        assert_eq!(max, vec3f(1.0, 5.0, 9.0));
    }

    #[test]
    fn sorted_stream_is_monotonic_in_morton_order() {
        let points: Vec<Point> = (0..500)
            .map(|i| point_at((i % 7) as f32, (i % 5) as f32, (i % 11) as f32))
            .collect();
        let (min, max, count) = compute_bounds(&points).unwrap();
        let dim = build_dim(min, max, 8);
        let scale = compute_scale(min, max);
        let tmp = std::env::temp_dir().join(format!("octlod-sort-test-{}", std::process::id()));
        std::fs::create_dir_all(&tmp).unwrap();
        let sorter = ExternalSorter::new(dim, min, scale, 4096, &tmp);
        let stream: MergeStream<MortonMedium> = sorter.sort(&points, count).unwrap();
        let codes: Result<Vec<(MortonMedium, Point)>> = stream.collect();
        let codes = codes.unwrap();
        assert_eq!(codes.len(), points.len());
        for pair in codes.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn non_unit_extent_points_are_rescaled_before_coding() {
        // raw extent is 10 units wide on x, well past the [0,1) cube the
        // octree's dim is defined over; every point must be rewritten to
        // `(p - min) * scale` before it is coded, or this would either
        // error out of the AABB or pile every point into one octant.
        let points: Vec<Point> = (0..16).map(|i| point_at(i as f32 * (10.0 / 15.0), 0.0, 0.0)).collect();
        let (min, max, count) = compute_bounds(&points).unwrap();
        assert_eq!(max.0 - min.0, 10.0);
        let dim = build_dim(min, max, 4);
        let scale = compute_scale(min, max);
        let tmp = std::env::temp_dir().join(format!("octlod-sort-scale-test-{}", std::process::id()));
        std::fs::create_dir_all(&tmp).unwrap();
        let sorter = ExternalSorter::new(dim, min, scale, 4096, &tmp);
        let stream: MergeStream<MortonMedium> = sorter.sort(&points, count).unwrap();
        let out: Vec<(MortonMedium, Point)> = stream.collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(out.len(), points.len());

        // the coded points are not all crammed into the same leaf, and
        // every decoded leaf coordinate is a distinct, increasing value:
        // exactly what scaling into the dim's own [0, size) cube gives.
        let levels: Vec<u32> = out.iter().map(|(c, _)| c.decode().0).collect();
        assert!(levels.iter().collect::<std::collections::HashSet<_>>().len() > 1);
        for pair in out.windows(2) {
            assert!(pair[0].1.pos.0 <= pair[1].1.pos.0);
        }
        // stored points themselves were rewritten into the post-scale cube.
        for (_, p) in &out {
            assert!(p.pos.0 >= 0.0 && p.pos.0 <= dim.size.0 + 1e-4);
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn ties_at_the_same_leaf_preserve_input_order() {
        // every point lands in the same morton cell; color carries the
        // original input index so we can check the output didn't reorder them.
        let points: Vec<Point> = (0..40)
            .map(|i| {
                let mut p = point_at(0.5, 0.5, 0.5);
                p.color = vec3f(i as f32, 0.0, 0.0);
                p
            })
            .collect();
        let count = points.len() as u64;
        let dim = OctreeDim::new(vec3f(0.0, 0.0, 0.0), vec3f(1.0, 1.0, 1.0), 4);
        let tmp = std::env::temp_dir().join(format!("octlod-sort-tie-test-{}", std::process::id()));
        std::fs::create_dir_all(&tmp).unwrap();
        // a tiny quota forces multiple spill chunks, so this also exercises
        // stability across chunk boundaries, not just within one chunk.
        let sorter = ExternalSorter::new(dim, vec3f(0.0, 0.0, 0.0), 1.0, 512, &tmp);
        let stream: MergeStream<MortonMedium> = sorter.sort(&points, count).unwrap();
        let out: Vec<(MortonMedium, Point)> = stream.collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(out.len(), points.len());
        for (i, (_, p)) in out.iter().enumerate() {
            assert_eq!(p.color.0 as usize, i);
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
