//! File-backed point source, sorted-stream container, and the optional
//! face-list passthrough.
//!
//! `PlyPointSource` reads an ASCII PLY subset: `x y z` required, `nx ny
//! nz` and `red green blue` optional, absent optionals zero-filled
//! (`red/green/blue` are stored 0-255 and rescaled to `0.0..=1.0`). The
//! sorted-stream format is this crate's own durable handoff between the
//! `sort` and `build` CLI stages: a small fixed header followed by
//! `{morton: u64, point}` records in the external sorter's own
//! `POS_NORMAL_COLOR` layout.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::error::{OctError, Result};
use crate::morton::MortonCode;
use crate::point::{AttributeSet, Point};
use crate::sort::PointSource;

const STREAM_MAGIC: &[u8; 4] = b"SRTP";
const STREAM_VERSION: u16 = 1;
const STREAM_RECORD_LAYOUT: AttributeSet = AttributeSet::POS_NORMAL_COLOR;

fn io_err(path: &Path, source: std::io::Error) -> OctError {
    OctError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn corrupt(path: &Path, msg: impl Into<String>) -> OctError {
    OctError::CorruptInput(format!("{}: {}", path.display(), msg.into()))
}

/// An ASCII-PLY-backed point source. `x y z` columns are required; `nx
/// ny nz` and `red green blue` are read if the header declares them and
/// zero-filled otherwise. Property order in the header governs column
/// order in the data lines, matching the original PLY reader's behavior.
pub struct PlyPointSource {
    path: PathBuf,
}

impl PlyPointSource {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PlyProp {
    X,
    Y,
    Z,
    Nx,
    Ny,
    Nz,
    R,
    G,
    B,
    Ignored,
}

impl PointSource for PlyPointSource {
    fn for_each(&self, visit: &mut dyn FnMut(Point)) -> Result<()> {
        let file = File::open(&self.path).map_err(|e| io_err(&self.path, e))?;
        let mut lines = BufReader::new(file).lines();

        let mut props = Vec::new();
        let mut vertex_count = None;
        loop {
            let line = lines
                .next()
                .ok_or_else(|| corrupt(&self.path, "truncated header"))?
                .map_err(|e| io_err(&self.path, e))?;
            let line = line.trim();
            if line == "end_header" {
                break;
            }
            let cols: Vec<&str> = line.split_whitespace().collect();
            match cols.as_slice() {
                ["element", "vertex", n] => {
                    vertex_count = Some(n.parse::<usize>().map_err(|_| corrupt(&self.path, "bad vertex count"))?);
                }
                ["property", _, name] => {
                    props.push(match *name {
                        "x" => PlyProp::X,
                        "y" => PlyProp::Y,
                        "z" => PlyProp::Z,
                        "nx" => PlyProp::Nx,
                        "ny" => PlyProp::Ny,
                        "nz" => PlyProp::Nz,
                        "red" => PlyProp::R,
                        "green" => PlyProp::G,
                        "blue" => PlyProp::B,
                        _ => PlyProp::Ignored,
                    });
                }
                _ => {}
            }
        }
        let vertex_count = vertex_count.ok_or_else(|| corrupt(&self.path, "missing element vertex"))?;

        for _ in 0..vertex_count {
            let line = lines
                .next()
                .ok_or_else(|| corrupt(&self.path, "fewer vertex lines than declared"))?
                .map_err(|e| io_err(&self.path, e))?;
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < props.len() {
                return Err(corrupt(&self.path, "vertex line shorter than property list"));
            }
            let mut point = Point::default();
            for (prop, raw) in props.iter().zip(cols.iter()) {
                match prop {
                    PlyProp::Ignored => {}
                    PlyProp::X | PlyProp::Y | PlyProp::Z | PlyProp::Nx | PlyProp::Ny | PlyProp::Nz => {
                        let v: f32 = raw.parse().map_err(|_| corrupt(&self.path, format!("bad float {raw:?}")))?;
                        match prop {
                            PlyProp::X => point.pos.0 = v,
                            PlyProp::Y => point.pos.1 = v,
                            PlyProp::Z => point.pos.2 = v,
                            PlyProp::Nx => point.normal.0 = v,
                            PlyProp::Ny => point.normal.1 = v,
                            PlyProp::Nz => point.normal.2 = v,
                            _ => unreachable!(),
                        }
                    }
                    PlyProp::R | PlyProp::G | PlyProp::B => {
                        let v: f32 = raw.parse().map_err(|_| corrupt(&self.path, format!("bad color channel {raw:?}")))?;
                        let scaled = v / 255.0;
                        match prop {
                            PlyProp::R => point.color.0 = scaled,
                            PlyProp::G => point.color.1 = scaled,
                            PlyProp::B => point.color.2 = scaled,
                            _ => unreachable!(),
                        }
                    }
                }
            }
            visit(point);
        }
        Ok(())
    }
}

/// Writes the durable handoff between `sort` and `build`: a fixed header
/// naming the record count and layout, then that many `{morton, point}`
/// records in ascending Morton order.
pub struct SortedStreamWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl SortedStreamWriter {
    pub fn create(path: impl Into<PathBuf>, count: u64) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path).map_err(|e| io_err(&path, e))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(STREAM_MAGIC).map_err(|e| io_err(&path, e))?;
        writer.write_all(&STREAM_VERSION.to_le_bytes()).map_err(|e| io_err(&path, e))?;
        writer
            .write_all(&(STREAM_RECORD_LAYOUT.bits() as u16).to_le_bytes())
            .map_err(|e| io_err(&path, e))?;
        writer.write_all(&count.to_le_bytes()).map_err(|e| io_err(&path, e))?;
        Ok(Self { path, writer })
    }

    pub fn write_record(&mut self, morton_bits: u64, point: &Point) -> Result<()> {
        let mut buf = Vec::with_capacity(8 + STREAM_RECORD_LAYOUT.record_size());
        buf.extend_from_slice(&morton_bits.to_le_bytes());
        point.write(STREAM_RECORD_LAYOUT, &mut buf);
        self.writer.write_all(&buf).map_err(|e| io_err(&self.path, e))
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush().map_err(|e| io_err(&self.path, e))
    }
}

/// Reads back a file written by [`SortedStreamWriter`] as an iterator of
/// `(morton, point)` pairs, suitable to hand straight to [`crate::builder::build`].
pub struct SortedStreamReader<M: MortonCode> {
    path: PathBuf,
    reader: BufReader<File>,
    count: u64,
    read: u64,
    _marker: PhantomData<M>,
}

impl<M: MortonCode> SortedStreamReader<M> {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path).map_err(|e| io_err(&path, e))?;
        let mut reader = BufReader::new(file);
        let mut magic = [0u8; 4];
        std::io::Read::read_exact(&mut reader, &mut magic).map_err(|e| io_err(&path, e))?;
        if &magic != STREAM_MAGIC {
            return Err(corrupt(&path, "bad magic"));
        }
        let mut u16_buf = [0u8; 2];
        std::io::Read::read_exact(&mut reader, &mut u16_buf).map_err(|e| io_err(&path, e))?;
        let version = u16::from_le_bytes(u16_buf);
        if version != STREAM_VERSION {
            return Err(corrupt(&path, format!("unsupported stream version {version}")));
        }
        std::io::Read::read_exact(&mut reader, &mut u16_buf).map_err(|e| io_err(&path, e))?;
        let layout_bits = u16::from_le_bytes(u16_buf);
        if layout_bits as u8 != STREAM_RECORD_LAYOUT.bits() {
            return Err(OctError::AttributeMismatch {
                expected: STREAM_RECORD_LAYOUT,
                found: AttributeSet::from_bits_truncate(layout_bits as u8),
            });
        }
        let mut u64_buf = [0u8; 8];
        std::io::Read::read_exact(&mut reader, &mut u64_buf).map_err(|e| io_err(&path, e))?;
        let count = u64::from_le_bytes(u64_buf);
        Ok(Self {
            path,
            reader,
            count,
            read: 0,
            _marker: PhantomData,
        })
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<M: MortonCode> Iterator for SortedStreamReader<M> {
    type Item = Result<(M, Point)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.read >= self.count {
            return None;
        }
        let record_size = 8 + STREAM_RECORD_LAYOUT.record_size();
        let mut buf = vec![0u8; record_size];
        if let Err(e) = std::io::Read::read_exact(&mut self.reader, &mut buf) {
            return Some(Err(io_err(&self.path, e)));
        }
        let morton_bits = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let code = match M::from_bits(morton_bits) {
            Ok(c) => c,
            Err(e) => return Some(Err(e)),
        };
        let point = match Point::read(STREAM_RECORD_LAYOUT, &buf[8..]) {
            Ok((p, _)) => p,
            Err(e) => return Some(Err(e)),
        };
        self.read += 1;
        Some(Ok((code, point)))
    }
}

/// A passthrough list of triangle vertex-index triples, carried alongside
/// a point cloud unmodified by sort or build (neither stage interprets
/// faces, they only need to survive the round trip).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaceList(pub Vec<[u32; 3]>);

impl FaceList {
    pub fn read_ascii(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| io_err(path, e))?;
        let mut faces = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| io_err(path, e))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() != 3 {
                return Err(corrupt(path, "face line is not exactly 3 indices"));
            }
            let mut idx = [0u32; 3];
            for (i, c) in cols.iter().enumerate() {
                idx[i] = c.parse().map_err(|_| corrupt(path, format!("bad index {c:?}")))?;
            }
            faces.push(idx);
        }
        Ok(Self(faces))
    }

    pub fn write_ascii(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| io_err(path, e))?;
        let mut writer = BufWriter::new(file);
        for [a, b, c] in &self.0 {
            writeln!(writer, "{a} {b} {c}").map_err(|e| io_err(path, e))?;
        }
        writer.flush().map_err(|e| io_err(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::morton::MortonMedium;
    use crate::vector::vec3f;

    fn tmp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("octlod-io-test-{}-{name}", std::process::id()))
    }

    #[test]
    fn ply_source_reads_required_and_optional_columns() {
        let path = tmp_path("ply-basic.ply");
        std::fs::write(
            &path,
            "ply\nformat ascii 1.0\nelement vertex 2\nproperty float x\nproperty float y\nproperty float z\nproperty float nx\nproperty float ny\nproperty float nz\nproperty uchar red\nproperty uchar green\nproperty uchar blue\nend_header\n1.0 2.0 3.0 0.0 1.0 0.0 255 0 0\n4.0 5.0 6.0 0.0 0.0 1.0 0 255 0\n",
        )
        .unwrap();
        let source = PlyPointSource::open(&path);
        let mut points = Vec::new();
        source.for_each(&mut |p| points.push(p)).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].pos, vec3f(1.0, 2.0, 3.0));
        assert_eq!(points[0].normal, vec3f(0.0, 1.0, 0.0));
        assert_eq!(points[0].color, vec3f(1.0, 0.0, 0.0));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn ply_source_zero_fills_missing_optionals() {
        let path = tmp_path("ply-minimal.ply");
        std::fs::write(
            &path,
            "ply\nformat ascii 1.0\nelement vertex 1\nproperty float x\nproperty float y\nproperty float z\nend_header\n1.0 2.0 3.0\n",
        )
        .unwrap();
        let source = PlyPointSource::open(&path);
        let mut points = Vec::new();
        source.for_each(&mut |p| points.push(p)).unwrap();
        assert_eq!(points[0].normal, vec3f(0.0, 0.0, 0.0));
        assert_eq!(points[0].color, vec3f(0.0, 0.0, 0.0));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sorted_stream_roundtrips_through_write_and_read() {
        let path = tmp_path("stream.srtp");
        let entries = vec![(10u64, Point::new(vec3f(1.0, 0.0, 0.0))), (20u64, Point::new(vec3f(0.0, 1.0, 0.0)))];
        let mut writer = SortedStreamWriter::create(&path, entries.len() as u64).unwrap();
        for (bits, point) in &entries {
            writer.write_record(*bits, point).unwrap();
        }
        writer.finish().unwrap();

        let reader = SortedStreamReader::<MortonMedium>::open(&path).unwrap();
        assert_eq!(reader.count(), 2);
        let read_back: Result<Vec<(MortonMedium, Point)>> = reader.collect();
        let read_back = read_back.unwrap();
        assert_eq!(read_back.len(), 2);
        assert_eq!(read_back[0].0.bits(), 10);
        assert_eq!(read_back[1].0.bits(), 20);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn face_list_roundtrips_through_ascii() {
        let path = tmp_path("faces.txt");
        let faces = FaceList(vec![[0, 1, 2], [2, 3, 0]]);
        faces.write_ascii(&path).unwrap();
        let read_back = FaceList::read_ascii(&path).unwrap();
        assert_eq!(read_back, faces);
        let _ = std::fs::remove_file(&path);
    }
}
