//! Pulling the log and executing queue entries.
//!
//! One puller task mirrors the shared log into the queue; a small pool of
//! worker tasks executes entries. Execution is idempotent: an entry whose
//! result is already active locally and registered in the keeper is a no-op,
//! so replaying after a crash or a double-leader window converges instead of
//! diverging.

use crate::fetcher::install_fetched_part;
use crate::log::EntryKind;
use crate::queue::QueueEntry;
use crate::replica::ReplicaCore;
use crate::{Error, Result};
use mergedb_storage::{DETACHED_DIR, DataPart, UNREPLICATED_DIR, merge_parts};
use mergedb_types::PartName;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Mirror new log entries into the queue on a fixed cadence.
pub(crate) async fn run_queue_puller(core: Arc<ReplicaCore>, token: CancellationToken) {
    let mut interval = tokio::time::interval(core.settings.pull_interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = interval.tick() => {}
        }
        let keeper = core.keeper();
        match core.queue.pull_logs_to_queue(&keeper, &core.table, &core.my).await {
            Ok(0) => {}
            Ok(pulled) => debug!(pulled, "pulled log entries"),
            Err(e) if e.is_retriable() => {
                debug!(error = %e, "log pull deferred");
            }
            Err(e) => error!(error = %e, "log pull failed"),
        }
    }
}

/// One queue worker: select, execute, remove on success.
pub(crate) async fn run_queue_worker(core: Arc<ReplicaCore>, token: CancellationToken) {
    loop {
        if token.is_cancelled() {
            return;
        }
        let Some((entry, guard)) = core.queue.select_entry() else {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(core.settings.pull_interval) => {}
            }
            continue;
        };

        let outcome = execute_entry(&core, &entry).await;
        match outcome {
            Ok(()) => {
                // Remove while still marked executing so no other worker can
                // reselect the entry in between.
                let keeper = core.keeper();
                if let Err(e) = core.queue.remove(&keeper, &core.my, &entry.node).await {
                    warn!(node = %entry.node, error = %e, "executed entry not yet removed");
                }
                drop(guard);
            }
            Err(e) => {
                drop(guard);
                handle_execution_failure(&core, &entry, e).await;
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
            }
        }
    }
}

async fn handle_execution_failure(core: &Arc<ReplicaCore>, entry: &QueueEntry, e: Error) {
    if let Error::NoActivePeer(part) = &e {
        // Nobody serves the part. If it only exists to feed a queued merge,
        // wait for the merged part instead of the ingredient.
        if let Some(merged) = core.queue.move_merge_siblings_to_end(part) {
            info!(part = %part, merged = %merged, "awaiting merged part instead of missing source");
            return;
        }
        warn!(part = %part, "part unavailable on every peer, handing to part checker");
        core.request_part_check(*part);
        return;
    }
    if e.is_retriable() {
        debug!(node = %entry.node, error = %e, "entry deferred");
    } else {
        error!(node = %entry.node, error = %e, "entry execution failed");
    }
}

/// Apply one entry locally. Returns `Ok(())` only once the entry's effect is
/// durable on this replica; the caller then removes the queue node.
pub(crate) async fn execute_entry(core: &Arc<ReplicaCore>, entry: &QueueEntry) -> Result<()> {
    match &entry.entry.kind {
        EntryKind::GetPart { part } => {
            if core.have_part(part).await? {
                debug!(part = %part, "already have part, skipping");
                return Ok(());
            }
            fetch_and_commit(core, part).await
        }
        EntryKind::AttachPart {
            part,
            source_part,
            from_unreplicated,
        } => {
            if core.have_part(part).await? {
                return Ok(());
            }
            if attach_from_local_source(core, part, source_part, *from_unreplicated).await? {
                return Ok(());
            }
            fetch_and_commit(core, part).await
        }
        EntryKind::MergeParts { parts, into } => {
            if core.have_part(into).await? {
                debug!(part = %into, "merge result already present, skipping");
                return Ok(());
            }
            let snapshot = core.parts.snapshot();
            let sources: Option<Vec<Arc<DataPart>>> = parts
                .iter()
                .map(|n| snapshot.get(n).map(Arc::clone))
                .collect();
            match sources {
                Some(sources) => {
                    let schema = core.schema();
                    let staging = core.table_dir.join(format!("tmp_{into}"));
                    let txn = merge_parts(&staging, *into, &schema, &sources)?;
                    let merged = txn.into_inner();
                    core.commit_part(merged, vec![]).await?;
                    info!(part = %into, "merged locally");
                    Ok(())
                }
                // Some input is gone (e.g. already merged away here); the
                // finished product must exist somewhere instead.
                None => fetch_and_commit(core, into).await,
            }
        }
        EntryKind::DropRange { range, detach } => {
            let keeper = core.keeper();
            core.queue.remove_range(&keeper, &core.my, range).await?;

            let removed = core.parts.remove_covered(range);
            for part in &removed {
                core.deregister_part(&part.name()).await?;
                if *detach {
                    part.detach(&core.table_dir, "")?;
                } else {
                    core.parts.retire([Arc::clone(part)]);
                }
            }
            info!(range = %range, removed = removed.len(), detach, "applied drop range");
            Ok(())
        }
    }
}

/// Fetch `part` from some active peer and commit it.
async fn fetch_and_commit(core: &Arc<ReplicaCore>, part: &PartName) -> Result<()> {
    let mut peers = core.active_peers().await?;
    peers.shuffle(&mut rand::thread_rng());

    for peer in peers {
        match core.exchange.fetch_part(&peer, part).await {
            Ok(Some(fetched)) => {
                let schema = core.schema();
                let staged = install_fetched_part(&core.table_dir, &schema, fetched)?;
                core.commit_part(staged, vec![]).await?;
                info!(part = %part, from = %peer, "fetched part");
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => warn!(part = %part, from = %peer, error = %e, "fetch attempt failed"),
        }
    }
    Err(Error::NoActivePeer(*part))
}

/// Try to satisfy an ATTACH_PART from the local `detached/` or
/// `unreplicated/` directory, per the entry's source flag. The staged copy
/// keeps the original intact until commit succeeds.
async fn attach_from_local_source(
    core: &Arc<ReplicaCore>,
    part: &PartName,
    source_part: &str,
    from_unreplicated: bool,
) -> Result<bool> {
    let source_dir = if from_unreplicated {
        UNREPLICATED_DIR
    } else {
        DETACHED_DIR
    };
    let source = core.table_dir.join(source_dir).join(source_part);
    if !source.is_dir() {
        return Ok(false);
    }

    let staging = core.table_dir.join(format!("tmp_attach_{part}"));
    copy_dir(&source, &staging)?;
    let schema = core.schema();
    let staged = match DataPart::load_from_dir(staging.clone(), *part, &schema)
        .and_then(|p| p.verify_checksums().map(|()| p))
    {
        Ok(p) => p,
        Err(e) => {
            warn!(source = %source.display(), error = %e, "detached part unusable, will fetch");
            let _ = std::fs::remove_dir_all(&staging);
            return Ok(false);
        }
    };
    core.commit_part(staged, vec![]).await?;
    info!(part = %part, source = %source.display(), "attached part from local source");
    Ok(true)
}

fn copy_dir(from: &std::path::Path, to: &std::path::Path) -> Result<()> {
    let io = |p: &std::path::Path, e| mergedb_storage::Error::Io {
        path: p.to_path_buf(),
        source: e,
    };
    std::fs::create_dir_all(to).map_err(|e| io(to, e))?;
    for entry in std::fs::read_dir(from).map_err(|e| io(from, e))? {
        let entry = entry.map_err(|e| io(from, e))?;
        let target = to.join(entry.file_name());
        std::fs::copy(entry.path(), &target).map_err(|e| io(&entry.path(), e))?;
    }
    Ok(())
}
