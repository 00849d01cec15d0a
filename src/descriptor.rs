//! The octree descriptor: a small JSON sidecar written by the sorter and
//! read by everyone downstream (builder, traversal driver, CLI `stats`)
//! to recover the dimensions, point count and attribute layout a run was
//! built with, without re-deriving them from the data itself.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dims::OctreeDim;
use crate::error::{OctError, Result};
use crate::point::AttributeSet;
use crate::vector::vec3f;

const DESCRIPTOR_VERSION: &str = "v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Vec3Doc {
    x: f32,
    y: f32,
    z: f32,
}

impl From<crate::vector::Vec3f32> for Vec3Doc {
    fn from(v: crate::vector::Vec3f32) -> Self {
        Self { x: v.0, y: v.1, z: v.2 }
    }
}

impl From<Vec3Doc> for crate::vector::Vec3f32 {
    fn from(d: Vec3Doc) -> Self {
        vec3f(d.x, d.y, d.z)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DescriptorDoc {
    version: String,
    points: PathBuf,
    database: PathBuf,
    size: Vec3Doc,
    origin: Vec3Doc,
    scale: f32,
    depth: u32,
    attributes: String,
    count: u64,
}

/// The decoded form of the on-disk descriptor, ready for direct use by
/// the dimension math and the store/builder.
#[derive(Debug, Clone)]
pub struct OctreeDescriptor {
    pub points: PathBuf,
    pub database: PathBuf,
    pub dim: OctreeDim,
    pub scale: f32,
    pub attributes: AttributeSet,
    pub count: u64,
}

impl OctreeDescriptor {
    pub fn new(points: PathBuf, database: PathBuf, dim: OctreeDim, scale: f32, attributes: AttributeSet, count: u64) -> Self {
        Self {
            points,
            database,
            dim,
            scale,
            attributes,
            count,
        }
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let doc = DescriptorDoc {
            version: DESCRIPTOR_VERSION.to_string(),
            points: self.points.clone(),
            database: self.database.clone(),
            size: self.dim.size.into(),
            origin: self.dim.origin.into(),
            scale: self.scale,
            depth: self.dim.max_level,
            attributes: self.attributes.descriptor_name().to_string(),
            count: self.count,
        };
        let file = File::create(path).map_err(|e| io_err(path, e))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &doc).map_err(|e| json_err(path, e))
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| io_err(path, e))?;
        let doc: DescriptorDoc = serde_json::from_reader(BufReader::new(file)).map_err(|e| json_err(path, e))?;
        if doc.version != DESCRIPTOR_VERSION {
            return Err(OctError::CorruptInput(format!(
                "descriptor at {path:?} has unsupported version {:?}",
                doc.version
            )));
        }
        let attributes = AttributeSet::from_descriptor_name(&doc.attributes)?;
        let dim = OctreeDim::new(doc.origin.into(), doc.size.into(), doc.depth);
        Ok(Self {
            points: doc.points,
            database: doc.database,
            dim,
            scale: doc.scale,
            attributes,
            count: doc.count,
        })
    }
}

fn io_err(path: &Path, source: std::io::Error) -> OctError {
    OctError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn json_err(path: &Path, source: serde_json::Error) -> OctError {
    OctError::CorruptInput(format!("malformed descriptor at {path:?}: {source}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("octlod-descriptor-test-{}-{name}", std::process::id()))
    }

    #[test]
    fn write_then_read_roundtrips_all_fields() {
        let path = tmp_path("roundtrip.json");
        let dim = OctreeDim::new(vec3f(0.0, 0.0, 0.0), vec3f(1.0, 1.0, 1.0), 12);
        let descriptor = OctreeDescriptor::new(
            PathBuf::from("points.srtp"),
            PathBuf::from("store.blob"),
            dim,
            0.5,
            AttributeSet::POS_NORMAL_COLOR,
            42,
        );
        descriptor.write(&path).unwrap();
        let read_back = OctreeDescriptor::read(&path).unwrap();
        assert_eq!(read_back.points, descriptor.points);
        assert_eq!(read_back.database, descriptor.database);
        assert_eq!(read_back.dim.origin, descriptor.dim.origin);
        assert_eq!(read_back.dim.size, descriptor.dim.size);
        assert_eq!(read_back.dim.max_level, descriptor.dim.max_level);
        assert_eq!(read_back.scale, descriptor.scale);
        assert_eq!(read_back.attributes, descriptor.attributes);
        assert_eq!(read_back.count, descriptor.count);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn empty_count_roundtrips() {
        let path = tmp_path("empty.json");
        let dim = OctreeDim::new(vec3f(0.0, 0.0, 0.0), vec3f(1.0, 1.0, 1.0), 1);
        let descriptor = OctreeDescriptor::new(PathBuf::from("p"), PathBuf::from("d"), dim, 1.0, AttributeSet::POS, 0);
        descriptor.write(&path).unwrap();
        let read_back = OctreeDescriptor::read(&path).unwrap();
        assert_eq!(read_back.count, 0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let path = tmp_path("badversion.json");
        std::fs::write(&path, r#"{"version":"v2","points":"p","database":"d","size":{"x":1,"y":1,"z":1},"origin":{"x":0,"y":0,"z":0},"scale":1.0,"depth":1,"attributes":"pos","count":0}"#).unwrap();
        let result = OctreeDescriptor::read(&path);
        assert!(matches!(result, Err(OctError::CorruptInput(_))));
        let _ = std::fs::remove_file(&path);
    }
}
