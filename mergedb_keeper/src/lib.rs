//! Abstract coordination store for the replicated merge-tree engine.
//!
//! [`Keeper`] is the seam every replicated component talks through: a
//! strongly-consistent hierarchical key-value store with atomic multi-op
//! transactions, ephemeral and sequential nodes, and one-shot watches. A
//! session-oriented handle is obtained from a [`KeeperConnector`]; when the
//! session is lost the handle turns permanently unusable and its expiry token
//! fires, at which point the owner is expected to reconnect and rebuild any
//! transient state.
//!
//! [`MemKeeper`] is the in-process implementation used by tests; it supports
//! forced session expiry to exercise recovery paths.

use bytes::Bytes;
use std::fmt::Debug;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

mod mem;

pub use mem::MemKeeper;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no node: {0}")]
    NoNode(String),

    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("version mismatch on {path}: expected {expected}, actual {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("ephemeral nodes cannot have children: {0}")]
    EphemeralParent(String),

    #[error("session expired")]
    SessionExpired,

    #[error("connection loss")]
    ConnectionLoss,
}

impl Error {
    /// Whether retrying the same operation on the same session can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionLoss)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How a node is created.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CreateMode {
    Persistent,
    /// Removed automatically when the creating session ends.
    Ephemeral,
    /// Name gets a 10-digit, per-parent, monotonically increasing suffix.
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self, Self::PersistentSequential | Self::EphemeralSequential)
    }
}

/// Node metadata returned alongside reads and writes.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Stat {
    /// Data version, bumped on every set. Used for optimistic concurrency.
    pub version: i32,
}

/// One operation of an atomic [`Keeper::multi`] batch.
#[derive(Debug, Clone)]
pub enum Op {
    Create {
        path: String,
        data: Bytes,
        mode: CreateMode,
    },
    Set {
        path: String,
        data: Bytes,
        /// `Some` checks the current version, `None` is unconditional.
        version: Option<i32>,
    },
    Remove {
        path: String,
        version: Option<i32>,
    },
    Check {
        path: String,
        version: i32,
    },
}

impl Op {
    pub fn create(path: impl Into<String>, data: impl Into<Bytes>, mode: CreateMode) -> Self {
        Self::Create {
            path: path.into(),
            data: data.into(),
            mode,
        }
    }

    pub fn set(path: impl Into<String>, data: impl Into<Bytes>, version: Option<i32>) -> Self {
        Self::Set {
            path: path.into(),
            data: data.into(),
            version,
        }
    }

    pub fn remove(path: impl Into<String>, version: Option<i32>) -> Self {
        Self::Remove {
            path: path.into(),
            version,
        }
    }

    pub fn check(path: impl Into<String>, version: i32) -> Self {
        Self::Check {
            path: path.into(),
            version,
        }
    }
}

/// Result of one multi op, in batch order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OpResult {
    /// Full path of the created node (carries the sequential suffix).
    Created(String),
    Set(Stat),
    Removed,
    Checked,
}

/// What a one-shot watch observed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchKind,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WatchKind {
    Created,
    Deleted,
    DataChanged,
    ChildrenChanged,
    /// The session that registered the watch expired; re-arm on a new session.
    SessionExpired,
}

/// A one-shot watch. Fires at most once and must be re-armed by re-issuing
/// the read that registered it.
pub type Watch = oneshot::Receiver<WatchEvent>;

/// One session with the coordination store.
///
/// All operations are linearizable across sessions. Every method fails with
/// [`Error::SessionExpired`] once the session is gone.
#[async_trait::async_trait]
pub trait Keeper: Send + Sync + Debug {
    /// Returns the full path of the created node.
    async fn create(&self, path: &str, data: Bytes, mode: CreateMode) -> Result<String>;

    async fn get(&self, path: &str) -> Result<(Bytes, Stat)>;

    async fn try_get(&self, path: &str) -> Result<Option<(Bytes, Stat)>>;

    /// Read and register a watch for the next change or deletion of the node.
    async fn get_w(&self, path: &str) -> Result<(Bytes, Stat, Watch)>;

    async fn set(&self, path: &str, data: Bytes, version: Option<i32>) -> Result<Stat>;

    /// Child names (not full paths), sorted.
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    /// Children plus a watch for the next child creation or removal.
    async fn children_w(&self, path: &str) -> Result<(Vec<String>, Watch)>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Existence check plus a watch for the node's next creation or deletion.
    async fn exists_w(&self, path: &str) -> Result<(bool, Watch)>;

    async fn remove(&self, path: &str, version: Option<i32>) -> Result<()>;

    /// Remove, treating a missing node as success. Returns whether it existed.
    async fn try_remove(&self, path: &str) -> Result<bool>;

    /// Apply the whole batch atomically; on any failure nothing is applied
    /// and the first failing op's error is returned.
    async fn multi(&self, ops: Vec<Op>) -> Result<Vec<OpResult>>;

    fn session_id(&self) -> u64;

    fn is_expired(&self) -> bool;

    /// Token cancelled when this session expires.
    fn expiry(&self) -> CancellationToken;
}

/// Produces fresh sessions; injected so recovery can reconnect after expiry.
#[async_trait::async_trait]
pub trait KeeperConnector: Send + Sync + Debug {
    async fn connect(&self) -> Result<std::sync::Arc<dyn Keeper>>;
}

/// Parent path, or `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    if idx == 0 {
        if path.len() > 1 { Some("/") } else { None }
    } else {
        Some(&path[..idx])
    }
}

/// Final component of a path.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers() {
        assert_eq!(parent_path("/a/b/c"), Some("/a/b"));
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/"), None);
        assert_eq!(node_name("/a/b/c"), "c");
    }
}
