//! Shared identifier and data-model types for the mergedb storage engine.

use serde::{Deserialize, Serialize};
use std::fmt::Display;

mod checksums;
mod part_name;
mod row;
mod schema;

pub use checksums::{FileChecksum, PartChecksums};
pub use part_name::{PartName, PartNameError, PartitionId};
pub use row::{Block, Row, Value};
pub use schema::{ColumnSpec, ColumnType, SchemaError, TableSchema};

/// A block number, allocated from a coordination-store sequence per partition.
///
/// Every part covers an inclusive `[left, right]` range of block numbers within
/// its partition. Freshly written parts cover exactly one number.
#[derive(
    Debug, Default, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash,
)]
pub struct BlockNumber(u64);

impl BlockNumber {
    pub fn new(n: u64) -> Self {
        Self(n)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for BlockNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of an entry in the replication log.
///
/// The text form is the coordination-store node name, `log-` followed by the
/// index zero-padded to ten digits so that lexicographic order matches numeric
/// order.
#[derive(
    Debug, Default, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash,
)]
pub struct LogIndex(u64);

impl LogIndex {
    pub fn new(n: u64) -> Self {
        Self(n)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Parse from a log node name, e.g. `log-0000000042`.
    pub fn from_node_name(name: &str) -> Option<Self> {
        name.strip_prefix("log-")?.parse().ok().map(Self)
    }

    pub fn node_name(&self) -> String {
        format!("log-{:010}", self.0)
    }
}

impl Display for LogIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.node_name())
    }
}

/// Version of the shared table schema, bumped on every ALTER.
#[derive(
    Debug, Default, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash,
)]
pub struct SchemaVersion(u32);

impl SchemaVersion {
    pub fn new(v: u32) -> Self {
        Self(v)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
