//! Cold tier of the sibling-group store: a single append-only blob file
//! plus an in-memory directory. A group's most recent write wins
//! (append-and-redirect rather than in-place rewrite), which keeps
//! `release` a single `write_all` plus a directory update instead of a
//! read-modify-write of the whole file.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{OctError, Result};
use crate::store::format::peek_group_members;

struct Slot {
    offset: u64,
    len: u32,
}

pub struct ColdStore {
    path: PathBuf,
    file: File,
    write_offset: u64,
    directory: HashMap<u64, Slot>,
    /// Child morton bits per parent, kept alongside `directory` so
    /// range queries don't need a full blob decode just to list members.
    children: HashMap<u64, Vec<u64>>,
}

impl ColdStore {
    /// Opens (creating if absent) the blob file at `path` and replays it
    /// to rebuild the directory and child index.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| io_err(&path, e))?;

        let mut directory = HashMap::new();
        let mut children = HashMap::new();
        let mut offset = 0u64;
        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(io_err(&path, e)),
            }
            let len = u32::from_le_bytes(len_buf);
            let mut blob = vec![0u8; len as usize];
            file.read_exact(&mut blob).map_err(|e| io_err(&path, e))?;
            let blob_offset = offset + 4;
            offset = blob_offset + len as u64;
            directory.insert(parent_key_of(&blob)?, Slot { offset: blob_offset, len });
            let (parent, members) = parent_key_and_members(&blob)?;
            children.insert(parent, members);
        }

        Ok(Self {
            path,
            file,
            write_offset: offset,
            directory,
            children,
        })
    }

    pub fn contains(&self, key: u64) -> bool {
        self.directory.contains_key(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = u64> + '_ {
        self.directory.keys().copied()
    }

    pub fn child_mortons(&self, key: u64) -> &[u64] {
        self.children.get(&key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Appends a serialized sibling group blob, superseding any previous
    /// blob stored under the same key.
    pub fn append(&mut self, key: u64, child_mortons: Vec<u64>, blob: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::End(0)).map_err(|e| io_err(&self.path, e))?;
        let len = blob.len() as u32;
        self.file.write_all(&len.to_le_bytes()).map_err(|e| io_err(&self.path, e))?;
        self.file.write_all(blob).map_err(|e| io_err(&self.path, e))?;
        self.file.flush().map_err(|e| io_err(&self.path, e))?;
        let slot_offset = self.write_offset + 4;
        self.write_offset = slot_offset + len as u64;
        self.directory.insert(key, Slot { offset: slot_offset, len });
        self.children.insert(key, child_mortons);
        Ok(())
    }

    pub fn load(&mut self, key: u64) -> Result<Option<Vec<u8>>> {
        let Some(slot) = self.directory.get(&key) else {
            return Ok(None);
        };
        let mut buf = vec![0u8; slot.len as usize];
        self.file.seek(SeekFrom::Start(slot.offset)).map_err(|e| io_err(&self.path, e))?;
        self.file.read_exact(&mut buf).map_err(|e| io_err(&self.path, e))?;
        Ok(Some(buf))
    }
}

fn parent_key_of(blob: &[u8]) -> Result<u64> {
    if blob.len() < 8 {
        return Err(OctError::CorruptInput("group blob shorter than its own key".into()));
    }
    Ok(u64::from_le_bytes(blob[0..8].try_into().unwrap()))
}

/// Width-erased peek used only to rebuild the child index at startup; the
/// concrete Morton width doesn't matter since we only read back raw bits.
fn parent_key_and_members(blob: &[u8]) -> Result<(u64, Vec<u64>)> {
    use crate::morton::MortonMedium;
    let (parent, members) = peek_group_members::<MortonMedium>(blob)?;
    Ok((parent.bits(), members.into_iter().map(|m| m.bits()).collect()))
}

fn io_err(path: &Path, source: std::io::Error) -> OctError {
    OctError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;
    use crate::point::{AttributeSet, Point};
    use crate::store::format::serialize_group;
    use crate::morton::{MortonCode, MortonMedium};
    use crate::vector::vec3f;

    fn tmp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("octlod-cold-test-{}-{name}", std::process::id()))
    }

    #[test]
    fn append_then_load_returns_the_same_blob() {
        let path = tmp_path("append-load.blob");
        let mut cold = ColdStore::open(&path).unwrap();
        let parent = MortonMedium::root();
        let child = parent.child(3).unwrap();
        let nodes = vec![Node::new_leaf(child, vec![Point::new(vec3f(1.0, 0.0, 0.0))])];
        let blob = serialize_group(parent, &nodes, AttributeSet::POS);
        cold.append(parent.bits(), vec![child.bits()], &blob).unwrap();

        assert!(cold.contains(parent.bits()));
        assert_eq!(cold.child_mortons(parent.bits()), &[child.bits()]);
        let loaded = cold.load(parent.bits()).unwrap().unwrap();
        assert_eq!(loaded, blob);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn reopen_rebuilds_directory_from_the_blob_file() {
        let path = tmp_path("reopen.blob");
        let parent = MortonMedium::root();
        let child = parent.child(1).unwrap();
        {
            let mut cold = ColdStore::open(&path).unwrap();
            let nodes = vec![Node::new_leaf(child, vec![Point::new(vec3f(0.0, 1.0, 0.0))])];
            let blob = serialize_group(parent, &nodes, AttributeSet::POS);
            cold.append(parent.bits(), vec![child.bits()], &blob).unwrap();
        }
        let reopened = ColdStore::open(&path).unwrap();
        assert!(reopened.contains(parent.bits()));
        assert_eq!(reopened.child_mortons(parent.bits()), &[child.bits()]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn a_second_append_supersedes_the_first_under_the_same_key() {
        let path = tmp_path("supersede.blob");
        let mut cold = ColdStore::open(&path).unwrap();
        let parent = MortonMedium::root();
        let c0 = parent.child(0).unwrap();
        let c1 = parent.child(1).unwrap();
        let first = serialize_group(parent, &[Node::new_leaf(c0, vec![Point::new(vec3f(1.0, 0.0, 0.0))])], AttributeSet::POS);
        cold.append(parent.bits(), vec![c0.bits()], &first).unwrap();
        let second = serialize_group(
            parent,
            &[
                Node::new_leaf(c0, vec![Point::new(vec3f(1.0, 0.0, 0.0))]),
                Node::new_leaf(c1, vec![Point::new(vec3f(0.0, 1.0, 0.0))]),
            ],
            AttributeSet::POS,
        );
        cold.append(parent.bits(), vec![c0.bits(), c1.bits()], &second).unwrap();

        assert_eq!(cold.child_mortons(parent.bits()), &[c0.bits(), c1.bits()]);
        let loaded = cold.load(parent.bits()).unwrap().unwrap();
        assert_eq!(loaded, second);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_key_loads_as_none() {
        let path = tmp_path("missing.blob");
        let cold = ColdStore::open(&path).unwrap();
        assert!(!cold.contains(999));
        let _ = std::fs::remove_file(&path);
    }
}
