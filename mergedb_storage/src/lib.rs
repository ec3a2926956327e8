//! Local merge-tree storage: immutable sorted data parts on disk, the active
//! part set visible to reads, the write path that turns blocks into level-0
//! parts, and the merger that compacts adjacent parts.
//!
//! Everything here is single-replica; replication and coordination live in
//! `mergedb_replication` and only ever drive this crate through its public
//! surface.

use mergedb_types::{PartName, SchemaError};
use std::path::PathBuf;

mod encode;
mod merger;
mod part;
mod part_set;
mod reader;
mod writer;
mod write_path;

pub use merger::{
    MergeSelection, MergeSettings, MergeTransaction, merge_parts, select_parts_to_merge,
};
pub use part::{
    COLUMNS_FILE, CHECKSUMS_FILE, DETACHED_DIR, DataPart, PRIMARY_INDEX_FILE, UNREPLICATED_DIR,
    column_file_name,
};
pub use part_set::{ActivePartSet, AddOutcome, PartsSnapshot};
pub use reader::{KeyRange, scan_parts};
pub use writer::{PartWriter, write_part_files};
pub use write_path::{PendingPart, split_block_into_parts};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bad manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("part {part} is corrupt: {reason}")]
    Corrupt { part: String, reason: String },

    #[error("checksum mismatch in part {part}: {detail}")]
    ChecksumMismatch { part: String, detail: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// Programmer bug: the added part intersects an active part it does not
    /// supersede. Never retried.
    #[error("part {new} overlaps active part {existing} without covering it")]
    PartsOverlap { new: PartName, existing: PartName },

    #[error("part {0} not found")]
    PartNotFound(PartName),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
