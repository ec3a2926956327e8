//! Shared state of one replica of one table.
//!
//! Everything long-lived hangs off [`ReplicaCore`]: the current keeper
//! session (swapped on reconnect), the local part set, the queue mirror and
//! the channels between background loops. The core itself has no tasks; the
//! table facade and the restarting loop own those.

use crate::fetcher::PartExchange;
use crate::log::{EntryKind, LogEntry};
use crate::paths::{ReplicaPaths, TablePaths};
use crate::queue::ReplicaQueue;
use crate::table::TableSettings;
use crate::{Error, Result};
use bytes::Bytes;
use mergedb_keeper::{CreateMode, Keeper, Op};
use mergedb_storage::{ActivePartSet, DataPart};
use mergedb_types::{PartChecksums, PartName, TableSchema};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Debug)]
pub(crate) struct ReplicaCore {
    pub(crate) settings: TableSettings,
    pub(crate) table: TablePaths,
    pub(crate) my: ReplicaPaths,
    pub(crate) replica_name: String,
    pub(crate) table_dir: PathBuf,
    keeper: RwLock<Arc<dyn Keeper>>,
    pub(crate) schema: RwLock<TableSchema>,
    pub(crate) parts: Arc<ActivePartSet>,
    pub(crate) queue: Arc<ReplicaQueue>,
    pub(crate) exchange: Arc<dyn PartExchange>,
    pub(crate) part_check_tx: mpsc::UnboundedSender<PartName>,
    pub(crate) is_leader: AtomicBool,
    /// Cancelled exactly once, by `ReplicatedTable::shutdown`.
    pub(crate) shutdown: CancellationToken,
}

impl ReplicaCore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        settings: TableSettings,
        table: TablePaths,
        replica_name: String,
        table_dir: PathBuf,
        keeper: Arc<dyn Keeper>,
        schema: TableSchema,
        exchange: Arc<dyn PartExchange>,
        part_check_tx: mpsc::UnboundedSender<PartName>,
    ) -> Self {
        let my = table.replica(&replica_name);
        Self {
            settings,
            table,
            my,
            replica_name,
            table_dir,
            keeper: RwLock::new(keeper),
            schema: RwLock::new(schema),
            parts: Arc::new(ActivePartSet::new()),
            queue: ReplicaQueue::new(),
            exchange,
            part_check_tx,
            is_leader: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// The current keeper session. Callers hold the Arc across one logical
    /// operation; after session expiry every call on it fails and the
    /// restarting loop swaps a fresh one in.
    pub(crate) fn keeper(&self) -> Arc<dyn Keeper> {
        Arc::clone(&self.keeper.read())
    }

    pub(crate) fn swap_keeper(&self, fresh: Arc<dyn Keeper>) {
        *self.keeper.write() = fresh;
    }

    pub(crate) fn schema(&self) -> TableSchema {
        self.schema.read().clone()
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Ask the part checker to look at `part` soon.
    pub(crate) fn request_part_check(&self, part: PartName) {
        // Send fails only during shutdown, when the answer no longer matters.
        let _ = self.part_check_tx.send(part);
    }

    /// Append one entry to the shared log.
    pub(crate) async fn append_log(&self, kind: EntryKind) -> Result<String> {
        let entry = LogEntry::new(&self.replica_name, kind);
        let path = self
            .keeper()
            .create(
                &self.table.log_entry_prefix(),
                entry.to_bytes(),
                CreateMode::PersistentSequential,
            )
            .await?;
        debug!(entry = %path, "appended log entry");
        Ok(path)
    }

    /// The op registering `name` with its checksums under this replica.
    pub(crate) fn register_part_op(&self, name: &PartName, checksums: &PartChecksums) -> Op {
        let payload = serde_json::to_vec(checksums).expect("checksums always serialize");
        Op::create(self.my.part(name), payload, CreateMode::Persistent)
    }

    /// Ops removing the registrations of active parts `name` supersedes.
    pub(crate) fn deregister_covered_ops(&self, name: &PartName) -> Vec<Op> {
        self.parts
            .snapshot()
            .iter()
            .filter(|p| *name != p.name() && name.contains(&p.name()))
            .map(|p| Op::remove(self.my.part(&p.name()), None))
            .collect()
    }

    /// Commit a staged part: one keeper multi (registration, superseded
    /// deregistrations, any caller ops such as block release or a log
    /// append), then the local rename and active-set swap.
    pub(crate) async fn commit_part(
        &self,
        mut part: DataPart,
        extra_ops: Vec<Op>,
    ) -> Result<Arc<DataPart>> {
        let name = part.name();
        let mut ops = vec![self.register_part_op(&name, part.checksums())];
        ops.extend(self.deregister_covered_ops(&name));
        ops.extend(extra_ops);
        self.keeper().multi(ops).await?;

        // The registration is durable; local failure past this point is
        // repaired by the part checker, not rolled back.
        if let Err(e) = part.commit_rename(&self.table_dir) {
            error!(part = %name, error = %e, "registered part failed local rename");
            self.request_part_check(name);
            return Err(e.into());
        }
        let part = Arc::new(part);
        self.parts.add_part(Arc::clone(&part))?;
        Ok(part)
    }

    /// Whether `name` (or a cover of it) is active locally *and* registered
    /// under this replica in the keeper. The executor's idempotence test.
    pub(crate) async fn have_part(&self, name: &PartName) -> Result<bool> {
        let covering = match self.parts.snapshot().covering(name) {
            Some(p) => p.name(),
            None => return Ok(false),
        };
        Ok(self.keeper().exists(&self.my.part(&covering)).await?)
    }

    /// Names of replicas currently marked active, self excluded.
    pub(crate) async fn active_peers(&self) -> Result<Vec<String>> {
        let keeper = self.keeper();
        let mut peers = Vec::new();
        for name in keeper.get_children(&self.table.replicas_dir()).await? {
            if name == self.replica_name {
                continue;
            }
            let replica = self.table.replica(&name);
            if keeper.exists(&replica.is_active()).await? {
                peers.push(name);
            }
        }
        Ok(peers)
    }

    /// All registered replicas, active or not.
    pub(crate) async fn all_replicas(&self) -> Result<Vec<String>> {
        Ok(self
            .keeper()
            .get_children(&self.table.replicas_dir())
            .await?)
    }

    /// Remove this replica's keeper registration of `name`, if any.
    pub(crate) async fn deregister_part(&self, name: &PartName) -> Result<bool> {
        Ok(self.keeper().try_remove(&self.my.part(name)).await?)
    }

    /// Parse a part registration payload back into checksums.
    pub(crate) fn parse_checksums(path: &str, data: &Bytes) -> Result<PartChecksums> {
        serde_json::from_slice(data).map_err(|e| Error::payload(path, e))
    }
}
