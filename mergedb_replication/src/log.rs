//! Entries of the replicated log and of per-replica queues.
//!
//! The log is append-only: persistent-sequential children of `log/`, total
//! order given by their sequence numbers. Entries are never mutated after
//! creation; the cleanup loop garbage-collects entries every replica has
//! pulled.

use crate::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use mergedb_types::PartName;
use serde::{Deserialize, Serialize};

/// What a log entry instructs replicas to do.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EntryKind {
    /// A replica wrote a new part; everyone else fetches it.
    #[serde(rename = "GET_PART")]
    GetPart { part: PartName },

    /// Merge `parts` (exact names, contiguous) into `into`.
    #[serde(rename = "MERGE_PARTS")]
    MergeParts {
        parts: Vec<PartName>,
        into: PartName,
    },

    /// Remove every part covered by `range`; `detach` keeps the data on disk
    /// under `detached/`.
    #[serde(rename = "DROP_RANGE")]
    DropRange { range: PartName, detach: bool },

    /// Re-introduce a part written outside the active set as `part`.
    #[serde(rename = "ATTACH_PART")]
    AttachPart {
        part: PartName,
        /// Directory entry the source replica attached from.
        source_part: String,
        /// Source sits under `unreplicated/` instead of `detached/`.
        #[serde(default)]
        from_unreplicated: bool,
    },
}

impl EntryKind {
    /// The part this entry is expected to make active locally, if any.
    /// DROP_RANGE has no result part; its range covers what must go away.
    pub fn result_part(&self) -> Option<PartName> {
        match self {
            Self::GetPart { part } => Some(*part),
            Self::MergeParts { into, .. } => Some(*into),
            Self::DropRange { .. } => None,
            Self::AttachPart { part, .. } => Some(*part),
        }
    }

    /// Block-number range this entry touches, for queue/range removal.
    pub fn affected_range(&self) -> PartName {
        match self {
            Self::GetPart { part } => *part,
            Self::MergeParts { into, .. } => *into,
            Self::DropRange { range, .. } => *range,
            Self::AttachPart { part, .. } => *part,
        }
    }
}

/// One replicated log entry.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Replica that appended the entry.
    pub source_replica: String,
    pub create_time: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EntryKind,
}

impl LogEntry {
    pub fn new(source_replica: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            source_replica: source_replica.into(),
            create_time: Utc::now(),
            kind,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        serde_json::to_vec(self)
            .expect("log entries always serialize")
            .into()
    }

    pub fn from_bytes(path: &str, data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::payload(path, e))
    }
}
