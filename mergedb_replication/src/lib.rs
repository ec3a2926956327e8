//! Replication of a merge-tree table across replicas through a shared
//! coordination store.
//!
//! Every state change is an entry in a single replicated log; each replica
//! pulls the log into a private queue and applies entries in its own time.
//! Merges and drops are decided by one elected leader but executed (or
//! fetched ready-made) by everyone. The only cross-replica data path is
//! [`PartExchange`], which ships whole part directories.
//!
//! [`ReplicatedTable`] is the public surface; everything else backs it.

use mergedb_types::{PartName, PartNameError};

mod alter;
mod block_alloc;
mod cleanup;
mod dedup;
mod executor;
mod fetcher;
mod leader;
mod log;
mod part_check;
mod paths;
mod queue;
mod replica;
mod restarting;
mod table;

pub use block_alloc::{
    AllocatedBlock, BlockLockState, allocate_block, check_block, gap_fully_abandoned,
    mark_abandoned,
};
pub use fetcher::{FetchedPart, LocalPartExchange, PartExchange};
pub use log::{EntryKind, LogEntry};
pub use paths::{ReplicaPaths, TablePaths};
pub use queue::QueueStatus;
pub use table::{ReplicaConfig, ReplicatedTable, TableSettings};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Keeper(#[from] mergedb_keeper::Error),

    #[error(transparent)]
    Storage(#[from] mergedb_storage::Error),

    #[error(transparent)]
    Schema(#[from] mergedb_types::SchemaError),

    #[error("bad part name in keeper data: {0}")]
    PartName(#[from] PartNameError),

    #[error("bad payload at {path}: {source}")]
    Payload {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("table metadata mismatch: {0}")]
    MetadataMismatch(String),

    #[error("columns changed concurrently, alter not applied")]
    AlterConflict,

    #[error("alter not confirmed by replica {0} in time")]
    AlterTimedOut(String),

    #[error("no active replica has part {0}")]
    NoActivePeer(PartName),

    #[error("this replica is not the leader")]
    NotLeader,

    #[error(
        "local parts diverge from the replica record ({detail}); \
         refusing to activate without the force_restore_data flag"
    )]
    SuspiciousLocalState { detail: String },

    #[error("table is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn payload(path: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Payload {
            path: path.into(),
            source,
        }
    }

    /// Whether the operation may succeed if simply tried again later on the
    /// same or a fresh session.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Keeper(e) => {
                e.is_transient() || matches!(e, mergedb_keeper::Error::SessionExpired)
            }
            Self::NoActivePeer(_) => true,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
