//! Layout of one table's subtree in the coordination store.
//!
//! ```text
//! <root>/metadata                      immutable table description
//! <root>/columns                       shared column set, versioned
//! <root>/log/log-NNNNNNNNNN            replication log
//! <root>/blocks/<content-hash>         insert-dedup records
//! <root>/block_numbers/<partition>/block-NNNNNNNNNN
//! <root>/temp/                         abandonable-lock holders
//! <root>/leader_election               ephemeral, held by the leader
//! <root>/replicas/<name>/...           per-replica state
//! ```

use mergedb_types::{LogIndex, PartName, PartitionId};

pub(crate) const LOG_NODE_PREFIX: &str = "log-";
pub(crate) const QUEUE_NODE_PREFIX: &str = "queue-";
pub(crate) const BLOCK_NODE_PREFIX: &str = "block-";

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TablePaths {
    root: String,
}

impl TablePaths {
    pub fn new(root: impl Into<String>) -> Self {
        let mut root = root.into();
        while root.ends_with('/') {
            root.pop();
        }
        Self { root }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn metadata(&self) -> String {
        format!("{}/metadata", self.root)
    }

    pub fn columns(&self) -> String {
        format!("{}/columns", self.root)
    }

    pub fn log_dir(&self) -> String {
        format!("{}/log", self.root)
    }

    pub fn log_entry(&self, index: LogIndex) -> String {
        format!("{}/log/{}", self.root, index.node_name())
    }

    /// Path prefix handed to sequential creates; the store appends the index.
    pub fn log_entry_prefix(&self) -> String {
        format!("{}/log/{LOG_NODE_PREFIX}", self.root)
    }

    /// Insert-dedup records, keyed by block content hash.
    pub fn blocks_dir(&self) -> String {
        format!("{}/blocks", self.root)
    }

    pub fn block_hash(&self, id: &str) -> String {
        format!("{}/blocks/{id}", self.root)
    }

    pub fn block_numbers_dir(&self) -> String {
        format!("{}/block_numbers", self.root)
    }

    pub fn partition_blocks_dir(&self, partition: PartitionId) -> String {
        format!("{}/block_numbers/{partition}", self.root)
    }

    pub fn block_node(&self, partition: PartitionId, number: u64) -> String {
        format!("{}/block_numbers/{partition}/{BLOCK_NODE_PREFIX}{number:010}", self.root)
    }

    pub fn block_node_prefix(&self, partition: PartitionId) -> String {
        format!("{}/block_numbers/{partition}/{BLOCK_NODE_PREFIX}", self.root)
    }

    pub fn temp_dir(&self) -> String {
        format!("{}/temp", self.root)
    }

    pub fn leader_election(&self) -> String {
        format!("{}/leader_election", self.root)
    }

    pub fn replicas_dir(&self) -> String {
        format!("{}/replicas", self.root)
    }

    pub fn replica(&self, name: &str) -> ReplicaPaths {
        ReplicaPaths {
            root: format!("{}/replicas/{name}", self.root),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReplicaPaths {
    root: String,
}

impl ReplicaPaths {
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn host(&self) -> String {
        format!("{}/host", self.root)
    }

    pub fn log_pointer(&self) -> String {
        format!("{}/log_pointer", self.root)
    }

    pub fn queue_dir(&self) -> String {
        format!("{}/queue", self.root)
    }

    pub fn queue_entry(&self, node: &str) -> String {
        format!("{}/queue/{node}", self.root)
    }

    pub fn queue_entry_prefix(&self) -> String {
        format!("{}/queue/{QUEUE_NODE_PREFIX}", self.root)
    }

    pub fn parts_dir(&self) -> String {
        format!("{}/parts", self.root)
    }

    pub fn part(&self, name: &PartName) -> String {
        format!("{}/parts/{name}", self.root)
    }

    pub fn columns(&self) -> String {
        format!("{}/columns", self.root)
    }

    pub fn is_active(&self) -> String {
        format!("{}/is_active", self.root)
    }

    pub fn flags_dir(&self) -> String {
        format!("{}/flags", self.root)
    }

    pub fn force_restore_flag(&self) -> String {
        format!("{}/flags/force_restore_data", self.root)
    }
}

/// Parse the `NNNNNNNNNN` suffix of a sequential node name.
pub(crate) fn sequence_of(node: &str, prefix: &str) -> Option<u64> {
    node.strip_prefix(prefix)?.parse().ok()
}
