//! Leader election and the merge selection loop.
//!
//! Whoever holds the ephemeral `leader_election` node is the leader; only
//! the leader turns merge opportunities into MERGE_PARTS log entries (and
//! partition drops into DROP_RANGE, via the table surface). Losing the
//! session releases the node, and with it leadership, atomically.

use crate::block_alloc::gap_fully_abandoned;
use crate::log::EntryKind;
use crate::replica::ReplicaCore;
use crate::{Error, Result};
use bytes::Bytes;
use mergedb_keeper::{CreateMode, Keeper};
use mergedb_storage::select_parts_to_merge;
use mergedb_types::PartName;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Contend for leadership; while leader, run the merge selector. Returns on
/// cancellation or when the session backing leadership is gone.
pub(crate) async fn run_leader_election(core: Arc<ReplicaCore>, token: CancellationToken) {
    let path = core.table.leader_election();
    loop {
        if token.is_cancelled() {
            return;
        }
        let keeper = core.keeper();
        match keeper
            .create(&path, Bytes::from(core.replica_name.clone()), CreateMode::Ephemeral)
            .await
        {
            Ok(_) => {
                info!(replica = %core.replica_name, "became leader");
                core.is_leader.store(true, Ordering::SeqCst);
                merge_selection_loop(&core, &keeper, &token).await;
                core.is_leader.store(false, Ordering::SeqCst);
                info!(replica = %core.replica_name, "leadership ended");
                if token.is_cancelled() {
                    // Clean handover on shutdown; on expiry the node is
                    // already gone with the session.
                    let _ = keeper.try_remove(&path).await;
                    return;
                }
            }
            Err(mergedb_keeper::Error::NodeExists(_)) => {
                match keeper.exists_w(&path).await {
                    Ok((true, watch)) => {
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = watch => {}
                        }
                    }
                    Ok((false, _)) => {}
                    Err(e) => {
                        debug!(error = %e, "election watch failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            Err(mergedb_keeper::Error::SessionExpired) => {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "leader election attempt failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn merge_selection_loop(
    core: &Arc<ReplicaCore>,
    keeper: &Arc<dyn Keeper>,
    token: &CancellationToken,
) {
    let mut interval = tokio::time::interval(core.settings.merge_interval);
    loop {
        let expiry = keeper.expiry();
        tokio::select! {
            _ = token.cancelled() => return,
            _ = expiry.cancelled() => return,
            _ = interval.tick() => {}
        }
        if let Err(e) = select_and_log_merge(core).await {
            if e.is_retriable() {
                debug!(error = %e, "merge selection deferred");
            } else {
                warn!(error = %e, "merge selection failed");
            }
            if matches!(e, Error::Keeper(mergedb_keeper::Error::SessionExpired)) {
                return;
            }
        }
    }
}

/// One selector pass: pick a licensed pair whose gap is fully abandoned,
/// append MERGE_PARTS, and pull it straight back into our own queue so the
/// next pass sees it as in flight.
pub(crate) async fn select_and_log_merge(core: &Arc<ReplicaCore>) -> Result<bool> {
    let snapshot = core.parts.snapshot();
    let virtual_parts = core.queue.virtual_parts();
    let keeper = core.keeper();

    let unclaimed = |name: &PartName| {
        !virtual_parts.iter().any(|v| !v.disjoint(name))
    };

    // The gap check talks to the keeper, so it cannot sit inside the sync
    // selection predicate. Reselect around unlicensed pairs instead of
    // giving up, so a fenced pair never shadows a licensable one.
    let mut unlicensed: Vec<(PartName, PartName)> = Vec::new();
    loop {
        let Some(selection) = select_parts_to_merge(&snapshot, &core.settings.merge, &|a, b| {
            unclaimed(&a.name())
                && unclaimed(&b.name())
                && !unlicensed.contains(&(a.name(), b.name()))
        }) else {
            return Ok(false);
        };

        let [a, b] = &selection.parts[..] else {
            return Err(Error::Unexpected(anyhow::anyhow!(
                "selector returned {} parts",
                selection.parts.len()
            )));
        };
        if !gap_fully_abandoned(
            &keeper,
            &core.table,
            selection.result.partition(),
            a.name().right,
            b.name().left,
        )
        .await?
        {
            debug!(a = %a.name(), b = %b.name(), "gap not fully abandoned, merge not licensed");
            unlicensed.push((a.name(), b.name()));
            continue;
        }

        core.append_log(EntryKind::MergeParts {
            parts: selection.parts.iter().map(|p| p.name()).collect(),
            into: selection.result,
        })
        .await?;
        info!(into = %selection.result, "scheduled merge");

        core.queue
            .pull_logs_to_queue(&keeper, &core.table, &core.my)
            .await?;
        return Ok(true);
    }
}
