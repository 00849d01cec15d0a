//! Typed error taxonomy for the octree pipeline.
//!
//! `OctError` is the single error type propagated with `?` across the
//! sorter, store, builder and traversal driver. The CLI wraps it in
//! `anyhow::Error` at the boundary to print a human-readable cause chain
//! and to pick an exit code.

use std::path::PathBuf;

use thiserror::Error;

use crate::morton::MortonBits;

#[derive(Error, Debug)]
pub enum OctError {
    /// A point fell outside the computed AABB after scaling, a record
    /// could not be parsed, or a referenced input file is missing.
    #[error("corrupt input: {0}")]
    CorruptInput(String),

    /// A run mixed two different point attribute layouts.
    #[error("attribute layout mismatch: run was opened as {expected:?}, saw {found:?}")]
    AttributeMismatch {
        expected: crate::point::AttributeSet,
        found: crate::point::AttributeSet,
    },

    /// A Morton code construction would exceed the width of its codec.
    #[error("morton code overflow: level {level} exceeds max width {max_level}")]
    OverflowMorton { level: u32, max_level: u32 },

    /// The memory quota is too small to hold even a single point record.
    #[error("quota too small: {quota} bytes cannot hold one record of {record_size} bytes")]
    QuotaTooSmall { quota: u64, record_size: u64 },

    /// The memory governor hit the hard threshold with nothing releasable.
    #[error("out of budget: {requested} bytes requested, {resident} resident of {quota} quota")]
    OutOfBudget {
        requested: u64,
        resident: u64,
        quota: u64,
    },

    /// Disk ran out of space while writing a chunk, group or descriptor.
    #[error("no space left writing {path:?}")]
    NoSpace { path: PathBuf },

    /// An I/O error while loading or persisting a sibling group.
    #[error("store i/o error on group {parent:?}: {source}")]
    StoreIO {
        parent: MortonBits,
        #[source]
        source: std::io::Error,
    },

    /// An I/O error not tied to a specific sibling group: sort spill
    /// files, the octree descriptor, or a point-source file.
    #[error("i/o error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A requested Morton key has no entry in the store.
    #[error("not found: {0:?}")]
    NotFound(MortonBits),

    /// A cooperative cancel signal was observed.
    #[error("cancelled")]
    Cancelled,
}

impl OctError {
    /// Maps this error to the CLI's process exit code: 3 corrupt, 4 i/o,
    /// 5 out of budget, 6 cancelled.
    pub fn exit_code(&self) -> i32 {
        match self {
            OctError::CorruptInput(_) | OctError::AttributeMismatch { .. } | OctError::OverflowMorton { .. } => 3,
            OctError::StoreIO { .. } | OctError::Io { .. } | OctError::NoSpace { .. } | OctError::NotFound(_) => 4,
            OctError::OutOfBudget { .. } | OctError::QuotaTooSmall { .. } => 5,
            OctError::Cancelled => 6,
        }
    }
}

pub type Result<T> = std::result::Result<T, OctError>;
