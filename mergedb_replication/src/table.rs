//! The replicated table: the surface the layers above this engine consume.

use crate::alter;
use crate::block_alloc::allocate_block;
use crate::cleanup::{self, DEFAULT_STAGING_TTL};
use crate::dedup;
use crate::fetcher::PartExchange;
use crate::log::{EntryKind, LogEntry};
use crate::part_check::run_part_checker;
use crate::paths::TablePaths;
use crate::queue::QueueStatus;
use crate::replica::ReplicaCore;
use crate::restarting::{activate_replica, run_session_supervisor};
use crate::{Error, Result};
use bytes::Bytes;
use mergedb_keeper::{CreateMode, Keeper, KeeperConnector, Op, parent_path};
use mergedb_storage::{
    ActivePartSet, DETACHED_DIR, DataPart, KeyRange, MergeSettings, scan_parts,
    write_part_files,
};
use mergedb_types::{
    Block, BlockNumber, ColumnSpec, PartName, PartitionId, Row, TableSchema,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Tunables of one table replica. Defaults suit production cadences; tests
/// shrink the intervals.
#[derive(Debug, Clone, Copy)]
pub struct TableSettings {
    pub queue_workers: usize,
    pub pull_interval: Duration,
    pub merge_interval: Duration,
    pub cleanup_interval: Duration,
    pub merge: MergeSettings,
    pub alter_timeout: Duration,
    /// Registered-but-missing parts tolerated at activation before the
    /// replica refuses to start without `force_restore_data`.
    pub max_suspicious_missing_parts: usize,
    pub staging_ttl: Duration,
    /// How long an insert-dedup record fends off identical re-inserts.
    pub dedup_block_ttl: Duration,
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            queue_workers: 2,
            pull_interval: Duration::from_millis(500),
            merge_interval: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(30),
            merge: MergeSettings::default(),
            alter_timeout: Duration::from_secs(60),
            max_suspicious_missing_parts: 10,
            staging_ttl: DEFAULT_STAGING_TTL,
            dedup_block_ttl: Duration::from_secs(3600),
        }
    }
}

/// Identity and storage location of this replica.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub replica_name: String,
    pub host: String,
    pub table_dir: PathBuf,
}

/// The immutable table description shared by all replicas. Column sets may
/// change; none of this may.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
struct TableMetadata {
    primary_key: Vec<String>,
    date_column: String,
    index_granularity: usize,
}

impl TableMetadata {
    fn of(schema: &TableSchema) -> Self {
        Self {
            primary_key: schema.primary_key.clone(),
            date_column: schema.date_column.clone(),
            index_granularity: schema.index_granularity,
        }
    }
}

#[derive(Debug)]
pub struct ReplicatedTable {
    core: Arc<ReplicaCore>,
    tracker: TaskTracker,
}

impl ReplicatedTable {
    /// Open (and, for the first replica, bootstrap) a replicated table.
    ///
    /// If the table subtree does not exist it is created from `schema`.
    /// Otherwise `schema`'s immutable properties must match the shared
    /// metadata and the shared column set takes precedence over the one
    /// passed in. Either way the replica registers itself, reloads local
    /// parts from `table_dir` and starts its background loops.
    pub async fn open(
        connector: Arc<dyn KeeperConnector>,
        exchange: Arc<dyn PartExchange>,
        table_root: &str,
        schema: TableSchema,
        config: ReplicaConfig,
        settings: TableSettings,
    ) -> Result<Self> {
        let keeper = connector.connect().await?;
        let table = TablePaths::new(table_root);

        let schema = bootstrap_or_verify(&keeper, &table, schema).await?;
        let newly_registered = register_replica(&keeper, &table, &config, &schema).await?;

        std::fs::create_dir_all(&config.table_dir).map_err(|e| {
            mergedb_storage::Error::Io {
                path: config.table_dir.clone(),
                source: e,
            }
        })?;

        let (part_check_tx, part_check_rx) = mpsc::unbounded_channel();
        let core = Arc::new(ReplicaCore::new(
            settings,
            table,
            config.replica_name.clone(),
            config.table_dir.clone(),
            keeper,
            schema,
            exchange,
            part_check_tx,
        ));

        load_local_parts(&core);
        activate_replica(&core).await?;
        if newly_registered {
            backfill_from_peers(&core).await?;
        }

        let tracker = TaskTracker::new();
        tracker.spawn(run_session_supervisor(Arc::clone(&core), connector));
        tracker.spawn(run_part_checker(
            Arc::clone(&core),
            part_check_rx,
            core.shutdown.clone(),
        ));
        tracker.spawn(cleanup::run_cleanup(Arc::clone(&core), core.shutdown.clone()));
        tracker.close();

        Ok(Self { core, tracker })
    }

    /// Write one block. Each month touched becomes one level-0 part,
    /// committed together with its GET_PART log entry, its dedup record and
    /// the release of its block number in a single keeper transaction. A
    /// piece whose content was already inserted (retry after a lost ack) is
    /// dropped and does not appear in the returned names.
    pub async fn write(&self, block: Block) -> Result<Vec<PartName>> {
        self.ensure_running()?;
        let schema = self.core.schema();
        let pending = mergedb_storage::split_block_into_parts(block, &schema)?;

        let mut written = Vec::with_capacity(pending.len());
        for piece in pending {
            let keeper = self.core.keeper();
            let block_id = dedup::block_content_id(&piece.rows);
            if let Some(existing) =
                dedup::find_duplicate(&keeper, &self.core.table, &block_id).await?
            {
                info!(part = %existing, "duplicate insert, skipping");
                continue;
            }

            let lock = allocate_block(&keeper, &self.core.table, piece.partition).await?;
            let name = PartName::level_zero(piece.min_date, piece.max_date, lock.number());

            let staging = self.core.table_dir.join(format!("tmp_insert_{name}"));
            let part = write_part_files(&staging, name, &schema, &piece.rows)?;

            let entry = LogEntry::new(&self.core.replica_name, EntryKind::GetPart { part: name });
            let mut extra = lock.release_ops();
            extra.push(dedup::register_op(&self.core.table, &block_id, name));
            extra.push(Op::create(
                self.core.table.log_entry_prefix(),
                entry.to_bytes(),
                CreateMode::PersistentSequential,
            ));

            match self.core.commit_part(part, extra).await {
                Ok(committed) => {
                    info!(part = %committed.name(), rows = committed.rows(), "wrote part");
                    written.push(name);
                }
                Err(e) => {
                    let _ = lock.abandon(&keeper).await;
                    let _ = std::fs::remove_dir_all(&staging);
                    // An identical insert raced us to the dedup record; its
                    // part carries our rows.
                    if let Error::Keeper(mergedb_keeper::Error::NodeExists(path)) = &e
                        && path.starts_with(&self.core.table.blocks_dir())
                    {
                        info!(part = %name, "duplicate insert committed concurrently, skipping");
                        continue;
                    }
                    warn!(part = %name, error = %e, "insert commit failed");
                    return Err(e);
                }
            }
        }
        Ok(written)
    }

    /// Read rows whose key falls in `range`, optionally projected to
    /// `columns` (empty = all), in key order.
    pub fn read(&self, columns: &[&str], range: &KeyRange) -> Result<Vec<Row>> {
        let schema = self.core.schema();
        let rows = scan_parts(&self.core.parts.snapshot(), &schema, range)?;
        if columns.is_empty() {
            return Ok(rows);
        }
        let indexes: Vec<usize> = columns
            .iter()
            .map(|c| {
                schema
                    .column_index(c)
                    .ok_or_else(|| mergedb_types::SchemaError::UnknownColumn((*c).to_string()))
            })
            .collect::<Result<_, _>>()?;
        Ok(rows
            .into_iter()
            .map(|row| indexes.iter().map(|&i| row[i].clone()).collect())
            .collect())
    }

    /// Replace the column set table-wide. Returns once every registered
    /// replica has applied the change.
    pub async fn alter_schema(&self, new_columns: Vec<ColumnSpec>) -> Result<()> {
        self.ensure_running()?;
        alter::alter_columns(&self.core, new_columns).await?;
        Ok(())
    }

    /// Drop (or detach) everything in `partition` up to a freshly allocated
    /// fence number. Leader-only, like all merge/drop production.
    pub async fn drop_partition(&self, partition: PartitionId, detach: bool) -> Result<()> {
        self.ensure_running()?;
        if !self.core.is_leader() {
            return Err(Error::NotLeader);
        }
        let keeper = self.core.keeper();

        let fence = allocate_block(&keeper, &self.core.table, partition).await?;
        let fence_number = fence.number();
        fence.abandon(&keeper).await?;

        let cover = PartName::cover_range(partition, BlockNumber::new(0), fence_number);
        // Fence the merge selector first, or it could schedule a merge
        // inside the range between our append and our own queue pull.
        self.core.queue.disable_merges_in_range(cover);
        self.core
            .queue
            .remove_range(&keeper, &self.core.my, &cover)
            .await?;
        self.core
            .append_log(EntryKind::DropRange {
                range: cover,
                detach,
            })
            .await?;
        info!(partition = %partition, fence = fence_number.as_u64(), detach, "dropped partition");
        Ok(())
    }

    /// Re-introduce a part from this replica's `detached/` directory (or,
    /// with `from_unreplicated`, its `unreplicated/` directory) under a
    /// fresh block number, replicating it to everyone.
    pub async fn attach_part(
        &self,
        source_name: &str,
        from_unreplicated: bool,
    ) -> Result<PartName> {
        self.ensure_running()?;
        let source: PartName = source_name.parse()?;
        let keeper = self.core.keeper();

        let lock = allocate_block(&keeper, &self.core.table, source.partition()).await?;
        let name = PartName::new(
            source.min_date,
            source.max_date,
            lock.number(),
            lock.number(),
            source.level,
        );

        let entry = LogEntry::new(
            &self.core.replica_name,
            EntryKind::AttachPart {
                part: name,
                source_part: source_name.to_string(),
                from_unreplicated,
            },
        );
        let mut ops = lock.release_ops();
        ops.push(Op::create(
            self.core.table.log_entry_prefix(),
            entry.to_bytes(),
            CreateMode::PersistentSequential,
        ));
        keeper.multi(ops).await?;
        info!(part = %name, source = %source_name, from_unreplicated, "attached part");
        Ok(name)
    }

    /// Re-introduce every cleanly detached part of `partition`, in name
    /// order. Parts quarantined with a prefix are skipped.
    pub async fn attach_partition(&self, partition: PartitionId) -> Result<Vec<PartName>> {
        self.ensure_running()?;
        let detached = self.core.table_dir.join(DETACHED_DIR);
        let mut names: Vec<String> = match std::fs::read_dir(&detached) {
            Ok(entries) => entries
                .flatten()
                .filter_map(|e| {
                    let node = e.file_name().to_string_lossy().into_owned();
                    node.parse::<PartName>()
                        .ok()
                        .filter(|p| p.partition() == partition)
                        .map(|_| node)
                })
                .collect(),
            Err(_) => return Ok(Vec::new()),
        };
        names.sort();

        let mut attached = Vec::with_capacity(names.len());
        for node in names {
            attached.push(self.attach_part(&node, false).await?);
        }
        Ok(attached)
    }

    pub fn is_leader(&self) -> bool {
        self.core.is_leader()
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.core.queue.status()
    }

    pub fn active_part_names(&self) -> Vec<PartName> {
        self.core.parts.snapshot().part_names()
    }

    /// The live part set, for registering this replica as a server with a
    /// part exchange such as [`crate::LocalPartExchange`].
    pub fn served_parts(&self) -> Arc<ActivePartSet> {
        Arc::clone(&self.core.parts)
    }

    /// Stop every background task and release `is_active`. Idempotent.
    pub async fn shutdown(&self) {
        self.core.shutdown.cancel();
        self.tracker.wait().await;
    }

    fn ensure_running(&self) -> Result<()> {
        if self.core.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }
}

/// Create the table subtree if this is the first replica; otherwise verify
/// the immutable metadata and adopt the shared column set.
async fn bootstrap_or_verify(
    keeper: &Arc<dyn Keeper>,
    table: &TablePaths,
    schema: TableSchema,
) -> Result<TableSchema> {
    let metadata_path = table.metadata();
    if keeper.exists(&metadata_path).await? {
        let (data, _) = keeper.get(&metadata_path).await?;
        let shared: TableMetadata =
            serde_json::from_slice(&data).map_err(|e| Error::payload(&metadata_path, e))?;
        if shared != TableMetadata::of(&schema) {
            return Err(Error::MetadataMismatch(format!(
                "shared {shared:?} differs from local table definition"
            )));
        }
        let (columns, _) = keeper.get(&table.columns()).await?;
        return alter::schema_from_bytes(&table.columns(), &columns);
    }

    create_ancestors(keeper, table.root()).await?;
    let metadata = serde_json::to_vec(&TableMetadata::of(&schema))
        .expect("metadata always serializes");
    let ops = vec![
        Op::create(table.root(), Bytes::new(), CreateMode::Persistent),
        Op::create(metadata_path, metadata, CreateMode::Persistent),
        Op::create(table.columns(), alter::schema_to_bytes(&schema), CreateMode::Persistent),
        Op::create(table.log_dir(), Bytes::new(), CreateMode::Persistent),
        Op::create(table.blocks_dir(), Bytes::new(), CreateMode::Persistent),
        Op::create(table.block_numbers_dir(), Bytes::new(), CreateMode::Persistent),
        Op::create(table.temp_dir(), Bytes::new(), CreateMode::Persistent),
        Op::create(table.replicas_dir(), Bytes::new(), CreateMode::Persistent),
    ];
    match keeper.multi(ops).await {
        Ok(_) => {
            info!(root = %table.root(), "bootstrapped table");
            Ok(schema)
        }
        // Lost the creation race; re-read what the winner wrote.
        Err(mergedb_keeper::Error::NodeExists(_)) => {
            let (columns, _) = keeper.get(&table.columns()).await?;
            alter::schema_from_bytes(&table.columns(), &columns)
        }
        Err(e) => Err(e.into()),
    }
}

async fn create_ancestors(keeper: &Arc<dyn Keeper>, path: &str) -> Result<()> {
    let mut ancestors = Vec::new();
    let mut current = path;
    while let Some(parent) = parent_path(current) {
        if parent == "/" {
            break;
        }
        ancestors.push(parent);
        current = parent;
    }
    for ancestor in ancestors.into_iter().rev() {
        match keeper
            .create(ancestor, Bytes::new(), CreateMode::Persistent)
            .await
        {
            Ok(_) | Err(mergedb_keeper::Error::NodeExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Register this replica if it is new. Returns whether it was created now.
async fn register_replica(
    keeper: &Arc<dyn Keeper>,
    table: &TablePaths,
    config: &ReplicaConfig,
    schema: &TableSchema,
) -> Result<bool> {
    let my = table.replica(&config.replica_name);
    if keeper.exists(my.root()).await? {
        keeper
            .set(&my.host(), Bytes::from(config.host.clone()), None)
            .await?;
        return Ok(false);
    }

    // Start pulling from the oldest entry still in the log; everything older
    // is backfilled part by part.
    let oldest = keeper
        .get_children(&table.log_dir())
        .await?
        .iter()
        .filter_map(|n| crate::paths::sequence_of(n, crate::paths::LOG_NODE_PREFIX))
        .min()
        .unwrap_or(0);

    let ops = vec![
        Op::create(my.root(), Bytes::new(), CreateMode::Persistent),
        Op::create(my.host(), Bytes::from(config.host.clone()), CreateMode::Persistent),
        Op::create(
            my.log_pointer(),
            Bytes::from(oldest.to_string()),
            CreateMode::Persistent,
        ),
        Op::create(my.queue_dir(), Bytes::new(), CreateMode::Persistent),
        Op::create(my.parts_dir(), Bytes::new(), CreateMode::Persistent),
        Op::create(my.columns(), alter::schema_to_bytes(schema), CreateMode::Persistent),
        Op::create(my.flags_dir(), Bytes::new(), CreateMode::Persistent),
    ];
    keeper.multi(ops).await?;
    info!(replica = %config.replica_name, "registered replica");
    Ok(true)
}

/// Load whatever parts already sit in the table directory, verifying each
/// against its checksum manifest. Corrupt parts are quarantined right here
/// and handed to the checker, which re-fetches what peers still hold.
fn load_local_parts(core: &Arc<ReplicaCore>) {
    let Ok(entries) = std::fs::read_dir(&core.table_dir) else {
        return;
    };
    let schema = core.schema();
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Ok(name) = file_name.to_string_lossy().parse::<PartName>() else {
            continue;
        };
        match DataPart::load(&core.table_dir, name, &schema)
            .and_then(|part| part.verify_checksums().map(|()| part))
        {
            Ok(part) => {
                if let Err(e) = core.parts.add_part(Arc::new(part)) {
                    warn!(part = %name, error = %e, "skipping part overlapping the active set");
                }
            }
            Err(e) => {
                warn!(part = %name, error = %e, "local part unusable, quarantining");
                let detached = core.table_dir.join(DETACHED_DIR);
                let _ = std::fs::create_dir_all(&detached);
                let target = detached.join(format!("broken_{name}"));
                if let Err(e) = std::fs::rename(core.table_dir.join(name.to_string()), &target) {
                    warn!(part = %name, error = %e, "failed to quarantine part");
                }
                core.request_part_check(name);
            }
        }
    }
    info!(parts = core.parts.snapshot().len(), "loaded local parts");
}

/// A brand-new replica owes itself every part the others already have:
/// entries older than its starting log pointer were compacted away, so fetch
/// the current state part by part.
async fn backfill_from_peers(core: &Arc<ReplicaCore>) -> Result<()> {
    let keeper = core.keeper();
    let mut wanted: Vec<PartName> = Vec::new();
    for replica in core.all_replicas().await? {
        if replica == core.replica_name {
            continue;
        }
        let parts_dir = core.table.replica(&replica).parts_dir();
        for node in keeper.get_children(&parts_dir).await? {
            if let Ok(name) = node.parse::<PartName>()
                && !wanted.contains(&name)
            {
                wanted.push(name);
            }
        }
    }
    for name in wanted {
        let entry = LogEntry::new(&core.replica_name, EntryKind::GetPart { part: name });
        core.queue.enqueue_local(&keeper, &core.my, entry).await?;
    }
    Ok(())
}
