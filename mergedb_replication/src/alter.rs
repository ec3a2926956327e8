//! ALTER propagation: one writer CASes the shared column set, every replica
//! applies the diff to its local parts and acknowledges by updating its own
//! `columns` copy.

use crate::replica::ReplicaCore;
use crate::{Error, Result};
use bytes::Bytes;
use mergedb_types::{ColumnSpec, TableSchema};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) fn schema_to_bytes(schema: &TableSchema) -> Bytes {
    serde_json::to_vec(schema)
        .expect("schemas always serialize")
        .into()
}

pub(crate) fn schema_from_bytes(path: &str, data: &[u8]) -> Result<TableSchema> {
    serde_json::from_slice(data).map_err(|e| Error::payload(path, e))
}

/// Change the shared column set and wait until every registered replica has
/// applied it. Fails with [`Error::AlterConflict`] if the shared record moves
/// under us, before or after our own write.
pub(crate) async fn alter_columns(
    core: &Arc<ReplicaCore>,
    new_columns: Vec<ColumnSpec>,
) -> Result<TableSchema> {
    let keeper = core.keeper();
    let path = core.table.columns();

    let (data, stat) = keeper.get(&path).await?;
    let current = schema_from_bytes(&path, &data)?;
    let next = current.with_columns(new_columns)?;

    match keeper
        .set(&path, schema_to_bytes(&next), Some(stat.version))
        .await
    {
        Ok(_) => {}
        Err(mergedb_keeper::Error::BadVersion { .. }) => return Err(Error::AlterConflict),
        Err(e) => return Err(e.into()),
    }
    let our_version = stat.version + 1;
    info!(version = next.version.as_u32(), "published new column set");

    let deadline = Instant::now() + core.settings.alter_timeout;
    for replica in core.all_replicas().await? {
        let replica_columns = core.table.replica(&replica).columns();
        loop {
            // If someone altered again, stop waiting; the later alter's
            // writer takes over confirmation duty.
            let (_, shared_stat) = keeper.get(&path).await?;
            if shared_stat.version != our_version {
                return Err(Error::AlterConflict);
            }

            let (data, _, watch) = keeper.get_w(&replica_columns).await?;
            let applied = schema_from_bytes(&replica_columns, &data)?;
            if applied.version >= next.version {
                debug!(replica = %replica, "alter confirmed");
                break;
            }
            if Instant::now() >= deadline {
                return Err(Error::AlterTimedOut(replica));
            }
            tokio::select! {
                _ = watch => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }
    Ok(next)
}

/// Watch the shared column set and apply changes locally as they land.
pub(crate) async fn run_alter_applier(core: Arc<ReplicaCore>, token: CancellationToken) {
    let path = core.table.columns();
    loop {
        if token.is_cancelled() {
            return;
        }
        let keeper = core.keeper();
        let (data, _, watch) = match keeper.get_w(&path).await {
            Ok(v) => v,
            Err(mergedb_keeper::Error::SessionExpired) => return,
            Err(e) => {
                debug!(error = %e, "column watch failed");
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
                continue;
            }
        };

        match schema_from_bytes(&path, &data) {
            Ok(shared) => {
                if shared.version != core.schema().version
                    && let Err(e) = apply_alter(&core, shared).await
                {
                    warn!(error = %e, "failed to apply column change");
                }
            }
            Err(e) => warn!(error = %e, "unreadable shared column set"),
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = watch => {}
        }
    }
}

/// Bring local parts, the in-memory schema and our keeper `columns` copy in
/// line with `shared`. Added columns are manifest-only (reads fill type
/// defaults); dropped columns lose their files.
pub(crate) async fn apply_alter(core: &Arc<ReplicaCore>, shared: TableSchema) -> Result<()> {
    let old = core.schema();
    let dropped: Vec<String> = old
        .columns
        .iter()
        .filter(|c| !shared.columns.iter().any(|n| n.name == c.name))
        .map(|c| c.name.clone())
        .collect();

    if !dropped.is_empty() {
        let keeper = core.keeper();
        for part in core.parts.snapshot().iter() {
            if !part
                .columns()
                .iter()
                .any(|c| dropped.contains(&c.name))
            {
                continue;
            }
            let updated = part.with_columns_dropped(&dropped)?;
            let payload = serde_json::to_vec(updated.checksums())
                .expect("checksums always serialize");
            keeper
                .set(&core.my.part(&part.name()), Bytes::from(payload), None)
                .await?;
            core.parts.replace(Arc::new(updated));
        }
    }

    *core.schema.write() = shared.clone();

    core.keeper()
        .set(&core.my.columns(), schema_to_bytes(&shared), None)
        .await?;
    info!(
        version = shared.version.as_u32(),
        dropped = dropped.len(),
        "applied column change"
    );
    Ok(())
}
