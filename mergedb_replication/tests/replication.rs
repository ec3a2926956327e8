//! End-to-end tests of multi-replica tables over the in-memory keeper and
//! the in-process part exchange.

use bytes::Bytes;
use chrono::NaiveDate;
use mergedb_keeper::{Keeper, KeeperConnector, MemKeeper};
use mergedb_replication::{
    LocalPartExchange, ReplicaConfig, ReplicatedTable, TablePaths, TableSettings, allocate_block,
};
use mergedb_storage::{KeyRange, MergeSettings, write_part_files};
use mergedb_types::{
    Block, ColumnSpec, ColumnType, PartChecksums, PartName, PartitionId, Row, TableSchema, Value,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const ROOT: &str = "/tables/visits";

fn schema() -> TableSchema {
    TableSchema::new(
        vec![
            ColumnSpec::new("date", ColumnType::Date),
            ColumnSpec::new("id", ColumnType::UInt64),
            ColumnSpec::new("value", ColumnType::Int64),
        ],
        vec!["id".into()],
        "date",
        2,
    )
    .unwrap()
}

fn fast_settings() -> TableSettings {
    TableSettings {
        pull_interval: Duration::from_millis(10),
        merge_interval: Duration::from_millis(30),
        cleanup_interval: Duration::from_millis(200),
        merge: MergeSettings::default(),
        ..TableSettings::default()
    }
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2014, 1, d).unwrap()
}

/// One block of (day-of-january, id, value) rows.
fn block(entries: &[(u32, u64, i64)]) -> Block {
    Block::new(
        entries
            .iter()
            .map(|&(d, id, v)| vec![Value::Date(day(d)), Value::UInt64(id), Value::Int64(v)])
            .collect(),
    )
}

fn ids(rows: &[Row]) -> Vec<u64> {
    rows.iter()
        .map(|r| match r[1] {
            Value::UInt64(id) => id,
            ref other => panic!("id column held {other:?}"),
        })
        .collect()
}

#[derive(Clone)]
struct Cluster {
    server: MemKeeper,
    exchange: LocalPartExchange,
}

impl Cluster {
    fn new() -> Self {
        Self {
            server: MemKeeper::new(),
            exchange: LocalPartExchange::new(),
        }
    }

    async fn open(&self, name: &str, dir: &TempDir) -> ReplicatedTable {
        self.open_with(name, dir, fast_settings()).await
    }

    async fn open_with(&self, name: &str, dir: &TempDir, settings: TableSettings) -> ReplicatedTable {
        let table = ReplicatedTable::open(
            Arc::new(self.server.clone()),
            Arc::new(self.exchange.clone()),
            ROOT,
            schema(),
            ReplicaConfig {
                replica_name: name.to_string(),
                host: format!("{name}.local"),
                table_dir: dir.path().to_path_buf(),
            },
            settings,
        )
        .await
        .unwrap();
        self.exchange.register(name, table.served_parts());
        table
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[test_log::test(tokio::test)]
async fn writes_replicate_to_every_replica() {
    let cluster = Cluster::new();
    let (dir1, dir2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let r1 = cluster.open("r1", &dir1).await;
    let r2 = cluster.open("r2", &dir2).await;

    let written = r1.write(block(&[(3, 7, -1), (1, 2, 5)])).await.unwrap();
    assert_eq!(written.len(), 1);

    wait_until("r2 to fetch the part", || {
        r2.active_part_names() == written
    })
    .await;

    let from_r1 = r1.read(&[], &KeyRange::all()).unwrap();
    let from_r2 = r2.read(&[], &KeyRange::all()).unwrap();
    assert_eq!(ids(&from_r1), vec![2, 7]);
    assert_eq!(from_r1, from_r2);

    r1.shutdown().await;
    r2.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn merges_converge_on_both_replicas() {
    let cluster = Cluster::new();
    let (dir1, dir2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let r1 = cluster.open("r1", &dir1).await;
    let r2 = cluster.open("r2", &dir2).await;

    r1.write(block(&[(1, 10, 0), (2, 30, 0)])).await.unwrap();
    r1.write(block(&[(1, 20, 0), (3, 40, 0)])).await.unwrap();

    let merged = |table: &ReplicatedTable| {
        let names = table.active_part_names();
        names.len() == 1 && names[0].level >= 1
    };
    wait_until("the merge to land everywhere", || merged(&r1) && merged(&r2)).await;

    let rows = r2.read(&[], &KeyRange::all()).unwrap();
    assert_eq!(ids(&rows), vec![10, 20, 30, 40]);
    assert_eq!(rows, r1.read(&[], &KeyRange::all()).unwrap());

    r1.shutdown().await;
    r2.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn executing_an_entry_twice_is_harmless() {
    // A replica that already has the part (or a cover of it) must treat the
    // queue entry as done, which is what makes replays after restarts safe.
    let cluster = Cluster::new();
    let (dir1, dir2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let r1 = cluster.open("r1", &dir1).await;
    let r2 = cluster.open("r2", &dir2).await;

    r1.write(block(&[(1, 1, 1)])).await.unwrap();
    wait_until("replication and queues to drain", || {
        r1.queue_status().queued == 0
            && r2.queue_status().queued == 0
            && r2.active_part_names().len() == 1
    })
    .await;

    // The writer's own GET_PART entry was a no-op locally; both replicas hold
    // exactly the written part.
    assert_eq!(r1.active_part_names(), r2.active_part_names());

    r1.shutdown().await;
    r2.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn drop_partition_is_leader_only_and_replicates() {
    let cluster = Cluster::new();
    let (dir1, dir2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let r1 = cluster.open("r1", &dir1).await;
    let r2 = cluster.open("r2", &dir2).await;

    r1.write(block(&[(1, 1, 1), (2, 2, 2)])).await.unwrap();
    wait_until("replication", || r2.active_part_names().len() == 1).await;
    wait_until("a leader", || r1.is_leader() || r2.is_leader()).await;

    let partition: PartitionId = "201401".parse().unwrap();
    let (leader, follower) = if r1.is_leader() { (&r1, &r2) } else { (&r2, &r1) };
    let err = follower.drop_partition(partition, false).await.unwrap_err();
    assert!(matches!(err, mergedb_replication::Error::NotLeader));

    leader.drop_partition(partition, false).await.unwrap();
    wait_until("the drop to apply everywhere", || {
        r1.active_part_names().is_empty() && r2.active_part_names().is_empty()
    })
    .await;
    assert!(r1.read(&[], &KeyRange::all()).unwrap().is_empty());

    r1.shutdown().await;
    r2.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn detached_data_survives_and_reattaches() {
    let cluster = Cluster::new();
    let (dir1, dir2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let r1 = cluster.open("r1", &dir1).await;
    let r2 = cluster.open("r2", &dir2).await;

    let written = r1.write(block(&[(1, 5, 0), (2, 6, 0)])).await.unwrap();
    let original = written[0];
    wait_until("replication", || r2.active_part_names() == written).await;
    wait_until("a leader", || r1.is_leader() || r2.is_leader()).await;

    let partition: PartitionId = "201401".parse().unwrap();
    let leader = if r1.is_leader() { &r1 } else { &r2 };
    leader.drop_partition(partition, true).await.unwrap();
    wait_until("the detach to apply everywhere", || {
        r1.active_part_names().is_empty() && r2.active_part_names().is_empty()
    })
    .await;
    assert!(dir1.path().join("detached").join(original.to_string()).exists());

    let attached = r1.attach_part(&original.to_string(), false).await.unwrap();
    assert!(attached.left > original.right);
    wait_until("the attach to apply everywhere", || {
        r1.active_part_names() == vec![attached] && r2.active_part_names() == vec![attached]
    })
    .await;
    assert_eq!(ids(&r2.read(&[], &KeyRange::all()).unwrap()), vec![5, 6]);

    r1.shutdown().await;
    r2.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn late_joining_replica_backfills_current_state() {
    let cluster = Cluster::new();
    let (dir1, dir2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let r1 = cluster.open("r1", &dir1).await;

    r1.write(block(&[(1, 1, 1)])).await.unwrap();
    r1.write(block(&[(2, 2, 2)])).await.unwrap();
    wait_until("r1 queue to drain", || r1.queue_status().queued == 0).await;

    let r2 = cluster.open("r2", &dir2).await;
    wait_until("the new replica to backfill", || {
        ids(&r2.read(&[], &KeyRange::all()).unwrap()) == vec![1, 2]
    })
    .await;

    r1.shutdown().await;
    r2.shutdown().await;
}

#[derive(Debug)]
struct RecordingConnector {
    server: MemKeeper,
    last_session: Mutex<Option<u64>>,
}

#[async_trait::async_trait]
impl KeeperConnector for RecordingConnector {
    async fn connect(&self) -> mergedb_keeper::Result<Arc<dyn Keeper>> {
        let session = self.server.connect().await?;
        *self.last_session.lock() = Some(session.session_id());
        Ok(session)
    }
}

#[test_log::test(tokio::test)]
async fn replica_restarts_after_session_expiry() {
    let cluster = Cluster::new();
    let (dir1, dir2) = (TempDir::new().unwrap(), TempDir::new().unwrap());

    let connector = Arc::new(RecordingConnector {
        server: cluster.server.clone(),
        last_session: Mutex::new(None),
    });
    let r1 = ReplicatedTable::open(
        Arc::clone(&connector) as Arc<dyn KeeperConnector>,
        Arc::new(cluster.exchange.clone()),
        ROOT,
        schema(),
        ReplicaConfig {
            replica_name: "r1".to_string(),
            host: "r1.local".to_string(),
            table_dir: dir1.path().to_path_buf(),
        },
        fast_settings(),
    )
    .await
    .unwrap();
    cluster.exchange.register("r1", r1.served_parts());
    let r2 = cluster.open("r2", &dir2).await;

    r1.write(block(&[(1, 1, 1)])).await.unwrap();
    wait_until("replication", || r2.active_part_names().len() == 1).await;

    let doomed = connector.last_session.lock().unwrap();
    cluster.server.expire_session(doomed);
    wait_until("r1 to dial a new session", || {
        connector.last_session.lock().is_some_and(|s| s != doomed)
    })
    .await;

    // The replica keeps working on the new session; transient failures while
    // it re-activates are expected.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        match r1.write(block(&[(2, 2, 2)])).await {
            Ok(_) => break,
            Err(_) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("write never recovered: {e}"),
        }
    }
    wait_until("the post-restart write to replicate", || {
        ids(&r2.read(&[], &KeyRange::all()).unwrap()) == vec![1, 2]
    })
    .await;

    r1.shutdown().await;
    r2.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn lost_local_part_is_refetched_on_restart() {
    let cluster = Cluster::new();
    let (dir1, dir2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let r1 = cluster.open("r1", &dir1).await;
    let r2 = cluster.open("r2", &dir2).await;

    let written = r1.write(block(&[(1, 9, 9)])).await.unwrap();
    wait_until("replication", || r2.active_part_names() == written).await;

    r2.shutdown().await;
    drop(r2);
    std::fs::remove_dir_all(dir2.path().join(written[0].to_string())).unwrap();

    let r2 = cluster.open("r2", &dir2).await;
    wait_until("the lost part to be fetched back", || {
        r2.active_part_names() == written
    })
    .await;
    assert_eq!(ids(&r2.read(&[], &KeyRange::all()).unwrap()), vec![9]);

    r1.shutdown().await;
    r2.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn alter_propagates_and_rewrites_parts() {
    let cluster = Cluster::new();
    let (dir1, dir2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let r1 = cluster.open("r1", &dir1).await;
    let r2 = cluster.open("r2", &dir2).await;

    r1.write(block(&[(1, 1, 11), (2, 2, 22)])).await.unwrap();
    wait_until("replication", || r2.active_part_names().len() == 1).await;

    // Add a column: existing parts stay untouched, reads fill the default.
    r1.alter_schema(vec![
        ColumnSpec::new("date", ColumnType::Date),
        ColumnSpec::new("id", ColumnType::UInt64),
        ColumnSpec::new("value", ColumnType::Int64),
        ColumnSpec::new("extra", ColumnType::UInt64),
    ])
    .await
    .unwrap();

    let rows = r2.read(&["id", "extra"], &KeyRange::all()).unwrap();
    assert_eq!(
        rows,
        vec![
            vec![Value::UInt64(1), Value::UInt64(0)],
            vec![Value::UInt64(2), Value::UInt64(0)],
        ]
    );

    // Drop a column: every part loses its files for it, on every replica.
    r2.alter_schema(vec![
        ColumnSpec::new("date", ColumnType::Date),
        ColumnSpec::new("id", ColumnType::UInt64),
        ColumnSpec::new("extra", ColumnType::UInt64),
    ])
    .await
    .unwrap();

    let rows = r1.read(&[], &KeyRange::all()).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].len(), 3);
    let part = r1.active_part_names()[0];
    assert!(!dir1.path().join(part.to_string()).join("value.bin").exists());

    r1.shutdown().await;
    r2.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn duplicate_inserts_land_once() {
    let cluster = Cluster::new();
    let (dir1, dir2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let r1 = cluster.open("r1", &dir1).await;
    let r2 = cluster.open("r2", &dir2).await;

    let first = r1.write(block(&[(1, 1, 1)])).await.unwrap();
    assert_eq!(first.len(), 1);

    // A client retrying after a lost ack sends identical content; it must
    // not create a second part, even through the other replica.
    assert!(r1.write(block(&[(1, 1, 1)])).await.unwrap().is_empty());
    assert!(r2.write(block(&[(1, 1, 1)])).await.unwrap().is_empty());

    wait_until("replication and queues to drain", || {
        r1.queue_status().queued == 0 && r2.queue_status().queued == 0
    })
    .await;
    assert_eq!(ids(&r1.read(&[], &KeyRange::all()).unwrap()), vec![1]);
    assert_eq!(ids(&r2.read(&[], &KeyRange::all()).unwrap()), vec![1]);

    r1.shutdown().await;
    r2.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn expired_dedup_records_stop_deduplicating() {
    let cluster = Cluster::new();
    let dir1 = TempDir::new().unwrap();
    let settings = TableSettings {
        cleanup_interval: Duration::from_millis(50),
        dedup_block_ttl: Duration::from_millis(1),
        ..fast_settings()
    };
    let r1 = cluster.open_with("r1", &dir1, settings).await;

    r1.write(block(&[(1, 1, 1)])).await.unwrap();

    // The cleanup loop expires the record; the same content inserts again.
    let session = cluster.server.connect().await.unwrap();
    let blocks_dir = TablePaths::new(ROOT).blocks_dir();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while !session.get_children(&blocks_dir).await.unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "dedup record never expired");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let again = r1.write(block(&[(1, 1, 1)])).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(ids(&r1.read(&[], &KeyRange::all()).unwrap()), vec![1, 1]);

    r1.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn corrupted_part_is_quarantined_and_refetched() {
    let cluster = Cluster::new();
    let (dir1, dir2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let r1 = cluster.open("r1", &dir1).await;
    let r2 = cluster.open("r2", &dir2).await;

    let written = r1.write(block(&[(1, 9, 9)])).await.unwrap();
    wait_until("replication", || r2.active_part_names() == written).await;
    r2.shutdown().await;
    drop(r2);

    // Flip bytes in one column file behind the engine's back.
    let part_dir = dir2.path().join(written[0].to_string());
    std::fs::write(part_dir.join("id.bin"), [0xAB; 8]).unwrap();

    let r2 = cluster.open("r2", &dir2).await;
    wait_until("the corrupt part to be replaced", || {
        r2.active_part_names() == written
            && ids(&r2.read(&[], &KeyRange::all()).unwrap()) == vec![9]
    })
    .await;
    let broken = dir2
        .path()
        .join("detached")
        .join(format!("broken_{}", written[0]));
    assert!(broken.exists());

    // Both replicas register identical checksums for the part again.
    let session = cluster.server.connect().await.unwrap();
    let paths = TablePaths::new(ROOT);
    let (from_r1, _) = session.get(&paths.replica("r1").part(&written[0])).await.unwrap();
    let (from_r2, _) = session.get(&paths.replica("r2").part(&written[0])).await.unwrap();
    let from_r1: PartChecksums = serde_json::from_slice(&from_r1).unwrap();
    let from_r2: PartChecksums = serde_json::from_slice(&from_r2).unwrap();
    assert_eq!(from_r1, from_r2);

    r1.shutdown().await;
    r2.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn registration_divergence_is_repaired() {
    let cluster = Cluster::new();
    let (dir1, dir2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let r1 = cluster.open("r1", &dir1).await;
    let r2 = cluster.open("r2", &dir2).await;

    let written = r1.write(block(&[(1, 4, 4)])).await.unwrap();
    wait_until("replication", || r2.active_part_names() == written).await;
    r2.shutdown().await;
    drop(r2);

    // Rewrite what r2 claims to hold; the local files stay intact. The
    // registered record is ground truth, so the local copy must go.
    let session = cluster.server.connect().await.unwrap();
    let paths = TablePaths::new(ROOT);
    let record = paths.replica("r2").part(&written[0]);
    let mut bogus = PartChecksums::default();
    bogus.add("id.bin", 1, 1);
    session
        .set(&record, Bytes::from(serde_json::to_vec(&bogus).unwrap()), None)
        .await
        .unwrap();

    // The local copy stays readable, so the part looks active the whole
    // time; the quarantine directory and the repaired record are the
    // signals the checker actually ran.
    let r2 = cluster.open("r2", &dir2).await;
    let broken = dir2
        .path()
        .join("detached")
        .join(format!("broken_{}", written[0]));
    wait_until("the divergent copy to be quarantined", || broken.exists()).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let repaired = session
            .try_get(&record)
            .await
            .unwrap()
            .map(|(data, _)| serde_json::from_slice::<PartChecksums>(&data).unwrap());
        if repaired.is_some_and(|r| r != bogus) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "registration never repaired"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    wait_until("the refetched part to serve reads", || {
        r2.active_part_names() == written
            && ids(&r2.read(&[], &KeyRange::all()).unwrap()) == vec![4]
    })
    .await;

    r1.shutdown().await;
    r2.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn attach_from_unreplicated_directory() {
    let cluster = Cluster::new();
    let (dir1, dir2) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let r1 = cluster.open("r1", &dir1).await;
    let r2 = cluster.open("r2", &dir2).await;

    // A part written outside replication, e.g. by a bulk loader.
    let source: PartName = "20140101_20140102_0_0_0".parse().unwrap();
    let rows: Vec<Row> = vec![
        vec![Value::Date(day(1)), Value::UInt64(1), Value::Int64(5)],
        vec![Value::Date(day(2)), Value::UInt64(2), Value::Int64(6)],
    ];
    let unreplicated = dir1.path().join("unreplicated").join(source.to_string());
    write_part_files(&unreplicated, source, &schema(), &rows).unwrap();

    let attached = r1.attach_part(&source.to_string(), true).await.unwrap();
    wait_until("the attach to apply everywhere", || {
        r1.active_part_names() == vec![attached] && r2.active_part_names() == vec![attached]
    })
    .await;
    assert_eq!(ids(&r2.read(&[], &KeyRange::all()).unwrap()), vec![1, 2]);

    r1.shutdown().await;
    r2.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn held_gap_block_does_not_stall_other_partitions() {
    let cluster = Cluster::new();
    let dir1 = TempDir::new().unwrap();
    let r1 = cluster.open("r1", &dir1).await;
    wait_until("leadership", || r1.is_leader()).await;

    let session = cluster.server.connect().await.unwrap();
    let paths = TablePaths::new(ROOT);
    let january: PartitionId = "201401".parse().unwrap();

    // January: two parts around a block number some other writer still
    // holds; merging them is not licensed while the holder lives.
    r1.write(block(&[(1, 1, 0)])).await.unwrap();
    let held = allocate_block(&session, &paths, january).await.unwrap();
    r1.write(block(&[(1, 2, 0)])).await.unwrap();

    // February: a mergeable pair with no gap.
    let feb = |d: u32, id: u64| {
        Block::new(vec![vec![
            Value::Date(NaiveDate::from_ymd_opt(2014, 2, d).unwrap()),
            Value::UInt64(id),
            Value::Int64(0),
        ]])
    };
    r1.write(feb(1, 10)).await.unwrap();
    r1.write(feb(2, 20)).await.unwrap();

    let february: PartitionId = "201402".parse().unwrap();
    let merged_in = |table: &ReplicatedTable, partition: PartitionId| {
        table
            .active_part_names()
            .iter()
            .any(|p| p.partition() == partition && p.level >= 1)
    };
    wait_until("february to merge around the blocked january pair", || {
        merged_in(&r1, february)
    })
    .await;
    assert!(!merged_in(&r1, january));

    // Giving up the number licenses the january merge too.
    held.abandon(&session).await.unwrap();
    wait_until("january to merge after the abandon", || {
        merged_in(&r1, january)
    })
    .await;

    r1.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn key_range_reads_cut_across_parts() {
    let cluster = Cluster::new();
    let dir1 = TempDir::new().unwrap();
    let r1 = cluster.open("r1", &dir1).await;

    r1.write(block(&[(1, 1, 0), (1, 3, 0), (2, 5, 0)])).await.unwrap();
    r1.write(block(&[(1, 2, 0), (2, 4, 0)])).await.unwrap();

    let range = KeyRange::new(
        Some(vec![Value::UInt64(2)]),
        Some(vec![Value::UInt64(4)]),
    );
    let rows = r1.read(&["id"], &range).unwrap();
    assert_eq!(
        rows,
        vec![
            vec![Value::UInt64(2)],
            vec![Value::UInt64(3)],
            vec![Value::UInt64(4)],
        ]
    );

    r1.shutdown().await;
}
