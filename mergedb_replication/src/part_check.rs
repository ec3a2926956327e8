//! The part checker: reconciles local disk, the active set and the keeper
//! registration when anything suspects a part is wrong or missing.
//!
//! Requests arrive over a channel from the executor (fetch failed
//! everywhere), from commit error paths, and from startup verification. The
//! checker is the only component allowed to declare data lost, and does so
//! as loudly as possible.

use crate::block_alloc::mark_abandoned;
use crate::log::{EntryKind, LogEntry};
use crate::replica::ReplicaCore;
use crate::Result;
use mergedb_types::{BlockNumber, PartName};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) async fn run_part_checker(
    core: Arc<ReplicaCore>,
    mut rx: mpsc::UnboundedReceiver<PartName>,
    token: CancellationToken,
) {
    loop {
        let name = tokio::select! {
            _ = token.cancelled() => return,
            name = rx.recv() => match name {
                Some(name) => name,
                None => return,
            },
        };
        if let Err(e) = check_part(&core, &name).await {
            if e.is_retriable() {
                // Try again on the next request or after restart.
                debug!(part = %name, error = %e, "part check deferred");
                core.request_part_check(name);
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(core.settings.pull_interval) => {}
                }
            } else {
                warn!(part = %name, error = %e, "part check failed");
            }
        }
    }
}

/// Examine one part name and repair what can be repaired.
pub(crate) async fn check_part(core: &Arc<ReplicaCore>, name: &PartName) -> Result<()> {
    let keeper = core.keeper();
    let snapshot = core.parts.snapshot();

    if let Some(local) = snapshot.covering(name) {
        if local.name() != *name {
            // A wider part swallowed it; nothing to check under the old name.
            debug!(part = %name, covering = %local.name(), "covered by a wider part");
            return Ok(());
        }

        // Ground truth is the registered record, not the local manifest: a
        // part can be self-consistent on disk yet disagree with what this
        // replica claims to hold.
        let registration = core.my.part(name);
        let registered = match keeper.try_get(&registration).await? {
            Some((data, _)) => Some(ReplicaCore::parse_checksums(&registration, &data)?),
            None => None,
        };
        let divergence = registered
            .as_ref()
            .and_then(|r| r.first_mismatch(local.checksums()));

        let verdict = match divergence {
            Some(detail) => Err(detail),
            None => local
                .verify_checksums()
                .map_err(|e| e.to_string()),
        };
        match verdict {
            Ok(()) => {
                debug!(part = %name, "part verified");
                return Ok(());
            }
            Err(detail) => {
                warn!(part = %name, %detail, "local part does not match its claims, quarantining");
                if let Some(part) = core.parts.remove(name) {
                    part.detach(&core.table_dir, "broken_")?;
                }
                core.deregister_part(name).await?;
                enqueue_refetch(core, *name).await?;
                return Ok(());
            }
        }
    }

    // Not active locally. A stale registration must go before anything else.
    let was_registered = core.deregister_part(name).await?;
    if was_registered {
        info!(part = %name, "dropped registration of a part we do not have");
    }

    if core.queue.is_promised(name) {
        debug!(part = %name, "part is promised by the queue, leaving it alone");
        return Ok(());
    }

    let mut held_by_peer = false;
    for replica in core.all_replicas().await? {
        if replica == core.replica_name {
            continue;
        }
        if keeper
            .exists(&core.table.replica(&replica).part(name))
            .await?
        {
            held_by_peer = true;
            break;
        }
    }

    if held_by_peer {
        enqueue_refetch(core, *name).await?;
        return Ok(());
    }

    // Nobody has it and nothing will produce it. Unfence its numbers so
    // merges can close over the hole, and say what was lost.
    error!(part = %name, "part is lost on all replicas; data loss");
    let mut n = name.left.as_u64();
    while n <= name.right.as_u64() {
        mark_abandoned(&keeper, &core.table, name.partition(), BlockNumber::new(n)).await?;
        n += 1;
    }
    Ok(())
}

async fn enqueue_refetch(core: &Arc<ReplicaCore>, name: PartName) -> Result<()> {
    let keeper = core.keeper();
    let entry = LogEntry::new(&core.replica_name, EntryKind::GetPart { part: name });
    let node = core.queue.enqueue_local(&keeper, &core.my, entry).await?;
    info!(part = %name, node = %node, "queued re-fetch");
    Ok(())
}
