//! The per-replica queue: the replica's private, durable to-do list.
//!
//! `pull_logs_to_queue` copies log entries into `queue/` children, advancing
//! `log_pointer` in the same multi so an entry is never pulled twice and
//! never skipped. The in-memory mirror adds execution state: which entries
//! are running right now and which parts they will produce.

use crate::log::{EntryKind, LogEntry};
use crate::paths::{LOG_NODE_PREFIX, QUEUE_NODE_PREFIX, ReplicaPaths, TablePaths, sequence_of};
use crate::{Error, Result};
use bytes::Bytes;
use hashbrown::HashSet;
use mergedb_keeper::{CreateMode, Keeper, Op, OpResult, Stat, node_name};
use mergedb_types::{LogIndex, PartName};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

/// One queue entry: the keeper child name plus the decoded log entry.
#[derive(Debug)]
pub(crate) struct QueueEntry {
    pub(crate) node: String,
    pub(crate) entry: LogEntry,
}

/// Introspection snapshot of the queue.
#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub queued: usize,
    pub executing: usize,
    pub future_parts: Vec<PartName>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: VecDeque<Arc<QueueEntry>>,
    /// Node names of entries some worker is executing.
    executing: HashSet<String>,
    /// Result parts of executing entries.
    executing_parts: HashSet<PartName>,
    /// Covers merges must stay out of, recorded before the DROP_RANGE that
    /// justifies them hits the log.
    merge_blockers: Vec<PartName>,
}

#[derive(Debug, Default)]
pub(crate) struct ReplicaQueue {
    inner: Mutex<Inner>,
    /// Signalled whenever an entry finishes or the queue shrinks.
    changed: Notify,
}

impl ReplicaQueue {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Rebuild the in-memory mirror from the keeper. Clears execution state;
    /// callers must have stopped the workers first.
    pub(crate) async fn load(
        &self,
        keeper: &Arc<dyn Keeper>,
        replica: &ReplicaPaths,
    ) -> Result<usize> {
        let mut nodes: Vec<(u64, String)> = keeper
            .get_children(&replica.queue_dir())
            .await?
            .into_iter()
            .filter_map(|n| sequence_of(&n, QUEUE_NODE_PREFIX).map(|s| (s, n)))
            .collect();
        nodes.sort_unstable();

        let mut entries = VecDeque::with_capacity(nodes.len());
        for (_, node) in nodes {
            let path = replica.queue_entry(&node);
            let (data, _) = keeper.get(&path).await?;
            entries.push_back(Arc::new(QueueEntry {
                node,
                entry: LogEntry::from_bytes(&path, &data)?,
            }));
        }

        let count = entries.len();
        let mut inner = self.inner.lock();
        inner.entries = entries;
        inner.executing.clear();
        inner.executing_parts.clear();
        info!(entries = count, "loaded replica queue");
        Ok(count)
    }

    /// Copy unseen log entries into the queue. Each entry is one multi:
    /// create the queue child and advance `log_pointer` past the entry, with
    /// a version check so a concurrent puller loses cleanly.
    pub(crate) async fn pull_logs_to_queue(
        &self,
        keeper: &Arc<dyn Keeper>,
        table: &TablePaths,
        replica: &ReplicaPaths,
    ) -> Result<usize> {
        let (pointer, mut stat) = read_log_pointer(keeper, replica).await?;

        let mut log_nodes: Vec<(u64, String)> = keeper
            .get_children(&table.log_dir())
            .await?
            .into_iter()
            .filter_map(|n| sequence_of(&n, LOG_NODE_PREFIX).map(|s| (s, n)))
            .filter(|(s, _)| *s >= pointer.as_u64())
            .collect();
        log_nodes.sort_unstable();

        let mut pulled = 0;
        for (seq, log_node) in log_nodes {
            let log_path = format!("{}/{log_node}", table.log_dir());
            let (data, _) = keeper.get(&log_path).await?;
            let entry = LogEntry::from_bytes(&log_path, &data)?;

            let results = match keeper
                .multi(vec![
                    Op::create(
                        replica.queue_entry_prefix(),
                        data,
                        CreateMode::PersistentSequential,
                    ),
                    Op::set(
                        replica.log_pointer(),
                        Bytes::from((seq + 1).to_string()),
                        Some(stat.version),
                    ),
                ])
                .await
            {
                Ok(results) => results,
                // A concurrent pull (fresh session racing a dying one)
                // advanced the pointer first; its queue copy wins.
                Err(mergedb_keeper::Error::BadVersion { .. }) => break,
                Err(e) => return Err(e.into()),
            };

            let OpResult::Created(queue_path) = &results[0] else {
                return Err(Error::Unexpected(anyhow::anyhow!(
                    "multi create returned {results:?}"
                )));
            };
            stat.version += 1;

            let node = node_name(queue_path).to_string();
            debug!(log = %log_node, queue = %node, "pulled log entry");
            self.inner.lock().entries.push_back(Arc::new(QueueEntry {
                node,
                entry,
            }));
            pulled += 1;
        }
        Ok(pulled)
    }

    /// Pick the first entry a worker may run now: not already executing, its
    /// result part not produced by an in-flight entry, and (for merges) no
    /// source part still being produced.
    pub(crate) fn select_entry(
        self: &Arc<Self>,
    ) -> Option<(Arc<QueueEntry>, CurrentlyExecuting)> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .iter()
            .find(|e| {
                if inner.executing.contains(&e.node) {
                    return false;
                }
                if let Some(result) = e.entry.kind.result_part()
                    && inner.executing_parts.iter().any(|p| !p.disjoint(&result))
                {
                    return false;
                }
                if let EntryKind::MergeParts { parts, .. } = &e.entry.kind
                    && parts.iter().any(|s| inner.executing_parts.contains(s))
                {
                    return false;
                }
                true
            })
            .cloned()?;

        inner.executing.insert(entry.node.clone());
        let parts: Vec<PartName> = entry.entry.kind.result_part().into_iter().collect();
        for p in &parts {
            inner.executing_parts.insert(*p);
        }
        let guard = CurrentlyExecuting {
            queue: Arc::clone(self),
            node: entry.node.clone(),
            parts,
        };
        Some((entry, guard))
    }

    /// Insert an entry this replica decided on by itself (part-checker
    /// re-fetches): durable queue node first, then the local mirror.
    pub(crate) async fn enqueue_local(
        &self,
        keeper: &Arc<dyn Keeper>,
        replica: &ReplicaPaths,
        entry: LogEntry,
    ) -> Result<String> {
        let path = keeper
            .create(
                &replica.queue_entry_prefix(),
                entry.to_bytes(),
                CreateMode::PersistentSequential,
            )
            .await?;
        let node = node_name(&path).to_string();
        self.inner.lock().entries.push_back(Arc::new(QueueEntry {
            node: node.clone(),
            entry,
        }));
        self.changed.notify_waiters();
        Ok(node)
    }

    /// Remove a completed entry, keeper node first. Called only after the
    /// entry's effect is locally durable.
    pub(crate) async fn remove(
        &self,
        keeper: &Arc<dyn Keeper>,
        replica: &ReplicaPaths,
        node: &str,
    ) -> Result<()> {
        keeper.try_remove(&replica.queue_entry(node)).await?;
        let mut inner = self.inner.lock();
        inner.entries.retain(|e| e.node != node);
        drop(inner);
        self.changed.notify_waiters();
        Ok(())
    }

    /// Remove every queued entry whose target lies inside `cover`, waiting
    /// out entries currently executing. DROP_RANGE entries are never removed.
    pub(crate) async fn remove_range(
        &self,
        keeper: &Arc<dyn Keeper>,
        replica: &ReplicaPaths,
        cover: &PartName,
    ) -> Result<usize> {
        let mut removed = 0;
        loop {
            let notified = self.changed.notified();
            let (to_remove, still_executing) = {
                let inner = self.inner.lock();
                let mut rm = Vec::new();
                let mut busy = false;
                for e in &inner.entries {
                    if matches!(e.entry.kind, EntryKind::DropRange { .. }) {
                        continue;
                    }
                    if cover.contains(&e.entry.kind.affected_range()) {
                        if inner.executing.contains(&e.node) {
                            busy = true;
                        } else {
                            rm.push(Arc::clone(e));
                        }
                    }
                }
                (rm, busy)
            };

            for e in &to_remove {
                keeper.try_remove(&replica.queue_entry(&e.node)).await?;
                self.inner.lock().entries.retain(|x| x.node != e.node);
                debug!(node = %e.node, "removed queue entry inside dropped range");
                removed += 1;
            }
            if !still_executing {
                return Ok(removed);
            }
            notified.await;
        }
    }

    /// When `missing` cannot be fetched from anywhere but feeds a queued
    /// merge, push the merge's sibling fetches to the back of the queue and
    /// return the merged part to await instead.
    pub(crate) fn move_merge_siblings_to_end(&self, missing: &PartName) -> Option<PartName> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let (sources, into) = inner.entries.iter().find_map(|e| match &e.entry.kind {
            EntryKind::MergeParts { parts, into } if parts.contains(missing) => {
                Some((parts.clone(), *into))
            }
            _ => None,
        })?;

        let mut kept = VecDeque::with_capacity(inner.entries.len());
        let mut moved = Vec::new();
        for e in inner.entries.drain(..) {
            let is_sibling_fetch = matches!(
                &e.entry.kind,
                EntryKind::GetPart { part } if sources.contains(part)
            );
            if is_sibling_fetch {
                moved.push(e);
            } else {
                kept.push_back(e);
            }
        }
        kept.extend(moved);
        inner.entries = kept;
        Some(into)
    }

    /// Every cover the merge selector must keep clear of: result parts of
    /// queued entries, ranges of queued DROP_RANGEs, and explicit blockers.
    /// Queued drops count here even though they produce nothing, so the
    /// selector never schedules a merge the drop is about to erase.
    pub(crate) fn virtual_parts(&self) -> Vec<PartName> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .filter_map(|e| match &e.entry.kind {
                EntryKind::DropRange { range, .. } => Some(*range),
                kind => kind.result_part(),
            })
            .chain(inner.merge_blockers.iter().copied())
            .collect()
    }

    /// Block merge selection inside `cover` before the corresponding
    /// DROP_RANGE is appended, closing the append-to-pull window.
    pub(crate) fn disable_merges_in_range(&self, cover: PartName) {
        let mut inner = self.inner.lock();
        if !inner.merge_blockers.contains(&cover) {
            inner.merge_blockers.push(cover);
        }
    }

    /// Whether some queued entry will produce `part` or a part covering it.
    pub(crate) fn is_promised(&self, part: &PartName) -> bool {
        self.inner
            .lock()
            .entries
            .iter()
            .filter_map(|e| e.entry.kind.result_part())
            .any(|r| r.contains(part))
    }

    pub(crate) fn status(&self) -> QueueStatus {
        let inner = self.inner.lock();
        QueueStatus {
            queued: inner.entries.len(),
            executing: inner.executing.len(),
            future_parts: inner
                .entries
                .iter()
                .filter_map(|e| e.entry.kind.result_part())
                .collect(),
        }
    }

    /// Wait until `part` (or a cover of it) is no longer promised by the
    /// queue, i.e. the producing entry completed or was removed.
    pub(crate) async fn wait_not_promised(&self, part: &PartName) {
        loop {
            let notified = self.changed.notified();
            if !self.is_promised(part) {
                return;
            }
            notified.await;
        }
    }
}

/// RAII execution marker; releasing it wakes waiters and frees the entry's
/// result parts for other workers.
#[derive(Debug)]
pub(crate) struct CurrentlyExecuting {
    queue: Arc<ReplicaQueue>,
    node: String,
    parts: Vec<PartName>,
}

impl Drop for CurrentlyExecuting {
    fn drop(&mut self) {
        let mut inner = self.queue.inner.lock();
        inner.executing.remove(&self.node);
        for p in &self.parts {
            inner.executing_parts.remove(p);
        }
        drop(inner);
        self.queue.changed.notify_waiters();
    }
}

/// Read `log_pointer`: the index of the next log entry to pull.
pub(crate) async fn read_log_pointer(
    keeper: &Arc<dyn Keeper>,
    replica: &ReplicaPaths,
) -> Result<(LogIndex, Stat)> {
    let path = replica.log_pointer();
    let (data, stat) = keeper.get(&path).await?;
    let text = String::from_utf8_lossy(&data);
    let value: u64 = text.trim().parse().map_err(|_| {
        Error::Unexpected(anyhow::anyhow!("bad log pointer {text:?} at {path}"))
    })?;
    Ok((LogIndex::new(value), stat))
}
