//! Session lifecycle: activating a replica on a fresh keeper session and
//! restarting everything session-bound when the session expires.
//!
//! All queue, leader and alter tasks are children of one session scope.
//! When the session dies they are cancelled and joined, a new session is
//! dialed through the injected connector, the replica re-verifies its local
//! state against the keeper, and the tasks start again.

use crate::alter::run_alter_applier;
use crate::executor::{run_queue_puller, run_queue_worker};
use crate::leader::run_leader_election;
use crate::replica::ReplicaCore;
use crate::{Error, Result};
use bytes::Bytes;
use mergedb_keeper::{CreateMode, KeeperConnector};
use mergedb_types::PartName;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Re-establish this replica's presence on the current session: sanity-check
/// local parts against the keeper record, re-register strays, mark active,
/// reload the queue mirror.
pub(crate) async fn activate_replica(core: &Arc<ReplicaCore>) -> Result<()> {
    let keeper = core.keeper();

    let registered: Vec<PartName> = keeper
        .get_children(&core.my.parts_dir())
        .await?
        .iter()
        .filter_map(|n| n.parse().ok())
        .collect();
    let snapshot = core.parts.snapshot();

    let missing: Vec<PartName> = registered
        .iter()
        .filter(|n| snapshot.covering(n).is_none())
        .copied()
        .collect();
    let unregistered: Vec<PartName> = snapshot
        .iter()
        .map(|p| p.name())
        .filter(|n| !registered.contains(n))
        .collect();

    if missing.len() > core.settings.max_suspicious_missing_parts {
        let flagged = keeper.exists(&core.my.force_restore_flag()).await?;
        if !flagged {
            return Err(Error::SuspiciousLocalState {
                detail: format!(
                    "{} registered parts are not on local disk",
                    missing.len()
                ),
            });
        }
        warn!(
            missing = missing.len(),
            "force_restore_data set, activating despite divergence"
        );
        keeper.try_remove(&core.my.force_restore_flag()).await?;
    }

    for name in &unregistered {
        if let Some(part) = snapshot.get(name) {
            let op = core.register_part_op(name, part.checksums());
            match keeper.multi(vec![op]).await {
                Ok(_) => info!(part = %name, "re-registered local part"),
                Err(mergedb_keeper::Error::NodeExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    // Parts held both locally and in the keeper must agree on checksums;
    // the part checker settles any that do not.
    for part in snapshot.iter() {
        let name = part.name();
        if !registered.contains(&name) {
            continue;
        }
        let path = core.my.part(&name);
        let Some((data, _)) = keeper.try_get(&path).await? else {
            continue;
        };
        let divergent = match ReplicaCore::parse_checksums(&path, &data) {
            Ok(claimed) => claimed.first_mismatch(part.checksums()).is_some(),
            Err(_) => true,
        };
        if divergent {
            warn!(part = %name, "local part diverges from its registered record");
            core.request_part_check(name);
        }
    }

    keeper
        .create(
            &core.my.is_active(),
            Bytes::from(core.replica_name.clone()),
            CreateMode::Ephemeral,
        )
        .await?;

    core.queue.load(&keeper, &core.my).await?;

    for name in missing {
        core.request_part_check(name);
    }
    info!(replica = %core.replica_name, "replica active");
    Ok(())
}

/// Run the session-bound task set until table shutdown, recycling it across
/// session expiries.
pub(crate) async fn run_session_supervisor(
    core: Arc<ReplicaCore>,
    connector: Arc<dyn KeeperConnector>,
) {
    loop {
        let keeper = core.keeper();
        let session_token = core.shutdown.child_token();
        let tracker = TaskTracker::new();

        tracker.spawn(run_queue_puller(Arc::clone(&core), session_token.clone()));
        for _ in 0..core.settings.queue_workers {
            tracker.spawn(run_queue_worker(Arc::clone(&core), session_token.clone()));
        }
        tracker.spawn(run_leader_election(Arc::clone(&core), session_token.clone()));
        tracker.spawn(run_alter_applier(Arc::clone(&core), session_token.clone()));
        tracker.close();

        let expiry = keeper.expiry();
        tokio::select! {
            _ = core.shutdown.cancelled() => {
                session_token.cancel();
                tracker.wait().await;
                let _ = keeper.try_remove(&core.my.is_active()).await;
                info!(replica = %core.replica_name, "replica shut down");
                return;
            }
            _ = expiry.cancelled() => {
                warn!(replica = %core.replica_name, "keeper session expired, restarting");
                session_token.cancel();
                tracker.wait().await;
            }
        }

        // Reconnect until it works or the table goes away.
        loop {
            if core.shutdown.is_cancelled() {
                return;
            }
            match connector.connect().await {
                Ok(fresh) => {
                    core.swap_keeper(fresh);
                    match activate_replica(&core).await {
                        Ok(()) => break,
                        Err(e @ Error::SuspiciousLocalState { .. }) => {
                            // Loud and patient: an operator must set the
                            // force_restore_data flag to get past this.
                            error!(error = %e, "activation refused");
                        }
                        Err(e) => warn!(error = %e, "activation failed, will retry"),
                    }
                }
                Err(e) => warn!(error = %e, "keeper reconnect failed"),
            }
            tokio::select! {
                _ = core.shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        }
    }
}
