//! Background housekeeping: unlink retired parts, garbage-collect log
//! entries every replica has pulled and expired insert-dedup records, sweep
//! dead staging directories.
//!
//! Abandonable-lock holders need no sweeping here; they are ephemeral and
//! vanish with their session.

use crate::dedup::DedupRecord;
use crate::paths::{LOG_NODE_PREFIX, sequence_of};
use crate::replica::ReplicaCore;
use crate::queue::read_log_pointer;
use crate::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) async fn run_cleanup(core: Arc<ReplicaCore>, token: CancellationToken) {
    let mut interval = tokio::time::interval(core.settings.cleanup_interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = interval.tick() => {}
        }
        unlink_retired_parts(&core);
        sweep_stale_staging(&core);
        if let Err(e) = gc_log_entries(&core).await {
            if e.is_retriable() {
                debug!(error = %e, "log GC deferred");
            } else {
                warn!(error = %e, "log GC failed");
            }
        }
        if let Err(e) = gc_dedup_records(&core).await {
            if e.is_retriable() {
                debug!(error = %e, "dedup GC deferred");
            } else {
                warn!(error = %e, "dedup GC failed");
            }
        }
    }
}

/// Delete retired parts once no snapshot references them.
pub(crate) fn unlink_retired_parts(core: &Arc<ReplicaCore>) {
    for part in core.parts.take_removable() {
        match part.remove_from_disk() {
            Ok(()) => debug!(part = %part.name(), "unlinked retired part"),
            Err(e) => warn!(part = %part.name(), error = %e, "failed to unlink retired part"),
        }
    }
}

/// Remove `tmp_`-prefixed staging directories old enough that no live
/// operation can still own them (crashed merges, aborted fetches).
pub(crate) fn sweep_stale_staging(core: &Arc<ReplicaCore>) {
    let Ok(entries) = std::fs::read_dir(&core.table_dir) else {
        return;
    };
    let ttl = core.settings.staging_ttl;
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        if !name.starts_with("tmp_") {
            continue;
        }
        let old_enough = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| SystemTime::now().duration_since(t).ok())
            .is_some_and(|age| age >= ttl);
        if old_enough {
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => info!(dir = %name, "removed stale staging directory"),
                Err(e) => warn!(dir = %name, error = %e, "failed to remove staging directory"),
            }
        }
    }
}

/// Remove log entries below the minimum log pointer over all registered
/// replicas. A stalled replica stalls GC; that is deliberate, the entries
/// are still owed to it.
pub(crate) async fn gc_log_entries(core: &Arc<ReplicaCore>) -> Result<usize> {
    let keeper = core.keeper();

    let mut min_pointer = u64::MAX;
    for replica in core.all_replicas().await? {
        let paths = core.table.replica(&replica);
        let (pointer, _) = read_log_pointer(&keeper, &paths).await?;
        min_pointer = min_pointer.min(pointer.as_u64());
    }
    if min_pointer == u64::MAX {
        return Ok(0);
    }

    let mut removed = 0;
    for node in keeper.get_children(&core.table.log_dir()).await? {
        let Some(seq) = sequence_of(&node, LOG_NODE_PREFIX) else {
            continue;
        };
        if seq < min_pointer {
            keeper
                .try_remove(&format!("{}/{node}", core.table.log_dir()))
                .await?;
            removed += 1;
        }
    }
    if removed > 0 {
        debug!(removed, min_pointer, "garbage-collected log entries");
    }
    Ok(removed)
}

/// Remove insert-dedup records older than the dedup TTL. Unreadable records
/// go too; a record nothing can parse dedups nothing.
pub(crate) async fn gc_dedup_records(core: &Arc<ReplicaCore>) -> Result<usize> {
    let keeper = core.keeper();
    let dir = core.table.blocks_dir();
    if !keeper.exists(&dir).await? {
        return Ok(0);
    }

    let now = Utc::now();
    let mut removed = 0;
    for node in keeper.get_children(&dir).await? {
        let path = format!("{dir}/{node}");
        let Some((data, _)) = keeper.try_get(&path).await? else {
            continue;
        };
        let expired = match serde_json::from_slice::<DedupRecord>(&data) {
            Ok(record) => now
                .signed_duration_since(record.create_time)
                .to_std()
                .is_ok_and(|age| age >= core.settings.dedup_block_ttl),
            Err(_) => true,
        };
        if expired {
            keeper.try_remove(&path).await?;
            removed += 1;
        }
    }
    if removed > 0 {
        debug!(removed, "garbage-collected dedup records");
    }
    Ok(removed)
}

/// Default time a staging directory may exist before the sweeper takes it.
pub(crate) const DEFAULT_STAGING_TTL: Duration = Duration::from_secs(300);
