//! Block-number allocation with abandon-on-crash semantics.
//!
//! An allocation is two nodes: an ephemeral-sequential *holder* under
//! `temp/` and a persistent-sequential *main* node under the partition's
//! `block_numbers/` directory whose data is the holder path. The sequence
//! suffix of the main node is the block number.
//!
//! Releasing removes both nodes; the removal ops can ride the part-commit
//! multi so a number disappears exactly when its part registers. If the
//! session dies first, the holder evaporates and the main node is left
//! pointing at nothing: the number is *abandoned*, and merges may close over
//! it. A number with no main node at all was never allocated (or fed a part
//! that later got dropped) and never licenses a merge.

use crate::paths::{BLOCK_NODE_PREFIX, TablePaths, sequence_of};
use crate::{Error, Result};
use bytes::Bytes;
use mergedb_keeper::{CreateMode, Keeper, Op, node_name};
use mergedb_types::{BlockNumber, PartitionId};
use std::sync::Arc;
use tracing::debug;

const HOLDER_PREFIX: &str = "abandonable_lock-";

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BlockLockState {
    /// No main node: never allocated, or released together with its part.
    Unlocked,
    /// Allocation in progress; the holder session is alive.
    Locked,
    /// The holder died before the part committed. Merges may absorb it.
    Abandoned,
}

/// A freshly allocated block number, held until released or abandoned.
#[derive(Debug)]
pub struct AllocatedBlock {
    number: BlockNumber,
    partition: PartitionId,
    main_path: String,
    holder_path: String,
}

impl AllocatedBlock {
    pub fn number(&self) -> BlockNumber {
        self.number
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Ops releasing the number, for inclusion in a commit multi.
    pub fn release_ops(&self) -> Vec<Op> {
        vec![
            Op::remove(self.main_path.clone(), None),
            Op::remove(self.holder_path.clone(), None),
        ]
    }

    /// Release without committing anything else.
    pub async fn release(self, keeper: &Arc<dyn Keeper>) -> Result<()> {
        keeper.multi(self.release_ops()).await?;
        Ok(())
    }

    /// Explicitly abandon: empty the main node, drop the holder. The same
    /// state a crashed holder converges to.
    pub async fn abandon(self, keeper: &Arc<dyn Keeper>) -> Result<()> {
        keeper
            .multi(vec![
                Op::set(self.main_path.clone(), Bytes::new(), None),
                Op::remove(self.holder_path.clone(), None),
            ])
            .await?;
        debug!(partition = %self.partition, number = self.number.as_u64(), "abandoned block number");
        Ok(())
    }
}

/// Allocate the next block number of `partition`.
pub async fn allocate_block(
    keeper: &Arc<dyn Keeper>,
    paths: &TablePaths,
    partition: PartitionId,
) -> Result<AllocatedBlock> {
    let dir = paths.partition_blocks_dir(partition);
    match keeper
        .create(&dir, Bytes::new(), CreateMode::Persistent)
        .await
    {
        Ok(_) => {}
        Err(mergedb_keeper::Error::NodeExists(_)) => {}
        Err(e) => return Err(e.into()),
    }

    let holder_path = keeper
        .create(
            &format!("{}/{HOLDER_PREFIX}", paths.temp_dir()),
            Bytes::new(),
            CreateMode::EphemeralSequential,
        )
        .await?;

    let main_path = keeper
        .create(
            &paths.block_node_prefix(partition),
            Bytes::from(holder_path.clone()),
            CreateMode::PersistentSequential,
        )
        .await?;

    let number = sequence_of(node_name(&main_path), BLOCK_NODE_PREFIX).ok_or_else(|| {
        Error::Unexpected(anyhow::anyhow!(
            "sequential create returned unparsable node {main_path}"
        ))
    })?;

    Ok(AllocatedBlock {
        number: BlockNumber::new(number),
        partition,
        main_path,
        holder_path,
    })
}

/// State of one block number of a partition.
pub async fn check_block(
    keeper: &Arc<dyn Keeper>,
    paths: &TablePaths,
    partition: PartitionId,
    number: BlockNumber,
) -> Result<BlockLockState> {
    let path = paths.block_node(partition, number.as_u64());
    let Some((data, _)) = keeper.try_get(&path).await? else {
        return Ok(BlockLockState::Unlocked);
    };
    if data.is_empty() {
        return Ok(BlockLockState::Abandoned);
    }
    let holder = String::from_utf8_lossy(&data).to_string();
    if keeper.exists(&holder).await? {
        Ok(BlockLockState::Locked)
    } else {
        Ok(BlockLockState::Abandoned)
    }
}

/// Whether every block number strictly between `left` and `right` is
/// abandoned. An empty gap qualifies trivially.
pub async fn gap_fully_abandoned(
    keeper: &Arc<dyn Keeper>,
    paths: &TablePaths,
    partition: PartitionId,
    left: BlockNumber,
    right: BlockNumber,
) -> Result<bool> {
    let mut n = left.as_u64() + 1;
    while n < right.as_u64() {
        if check_block(keeper, paths, partition, BlockNumber::new(n)).await?
            != BlockLockState::Abandoned
        {
            return Ok(false);
        }
        n += 1;
    }
    Ok(true)
}

/// Create an empty main node for a number that has none, marking it
/// abandoned. Used by the part checker when a registered part is lost
/// forever and its numbers must stop fencing merges.
pub async fn mark_abandoned(
    keeper: &Arc<dyn Keeper>,
    paths: &TablePaths,
    partition: PartitionId,
    number: BlockNumber,
) -> Result<()> {
    let dir = paths.partition_blocks_dir(partition);
    match keeper
        .create(&dir, Bytes::new(), CreateMode::Persistent)
        .await
    {
        Ok(_) | Err(mergedb_keeper::Error::NodeExists(_)) => {}
        Err(e) => return Err(e.into()),
    }
    let path = paths.block_node(partition, number.as_u64());
    match keeper.create(&path, Bytes::new(), CreateMode::Persistent).await {
        Ok(_) => Ok(()),
        Err(mergedb_keeper::Error::NodeExists(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mergedb_keeper::{KeeperConnector, MemKeeper};

    async fn setup() -> (MemKeeper, Arc<dyn Keeper>, TablePaths) {
        let server = MemKeeper::new();
        let session = server.connect().await.unwrap();
        let paths = TablePaths::new("/t");
        for p in ["/t", &paths.block_numbers_dir(), &paths.temp_dir()] {
            session
                .create(p, Bytes::new(), CreateMode::Persistent)
                .await
                .unwrap();
        }
        (server, session, paths)
    }

    fn partition() -> PartitionId {
        "201401".parse().unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn numbers_are_sequential_within_partition() {
        let (_server, session, paths) = setup().await;
        let a = allocate_block(&session, &paths, partition()).await.unwrap();
        let b = allocate_block(&session, &paths, partition()).await.unwrap();
        assert_eq!(a.number().as_u64() + 1, b.number().as_u64());

        let other: PartitionId = "201402".parse().unwrap();
        let c = allocate_block(&session, &paths, other).await.unwrap();
        assert_eq!(c.number().as_u64(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn release_leaves_no_trace() {
        let (_server, session, paths) = setup().await;
        let lock = allocate_block(&session, &paths, partition()).await.unwrap();
        let number = lock.number();
        assert_eq!(
            check_block(&session, &paths, partition(), number).await.unwrap(),
            BlockLockState::Locked
        );
        lock.release(&session).await.unwrap();
        assert_eq!(
            check_block(&session, &paths, partition(), number).await.unwrap(),
            BlockLockState::Unlocked
        );
    }

    #[test_log::test(tokio::test)]
    async fn session_death_abandons() {
        let (server, session, paths) = setup().await;
        let holder_session = server.connect().await.unwrap();
        let lock = allocate_block(&holder_session, &paths, partition())
            .await
            .unwrap();
        let number = lock.number();

        server.expire_session(holder_session.session_id());
        assert_eq!(
            check_block(&session, &paths, partition(), number).await.unwrap(),
            BlockLockState::Abandoned
        );
    }

    #[test_log::test(tokio::test)]
    async fn gap_licensing() {
        let (server, session, paths) = setup().await;
        // Numbers 0 and 3 become parts; 1 and 2 are allocated and lost.
        let zero = allocate_block(&session, &paths, partition()).await.unwrap();
        let doomed_session = server.connect().await.unwrap();
        let one = allocate_block(&doomed_session, &paths, partition()).await.unwrap();
        let _two = allocate_block(&doomed_session, &paths, partition()).await.unwrap();
        let three = allocate_block(&session, &paths, partition()).await.unwrap();
        zero.release(&session).await.unwrap();
        three.release(&session).await.unwrap();

        let left = BlockNumber::new(0);
        let right = BlockNumber::new(3);
        assert!(
            !gap_fully_abandoned(&session, &paths, partition(), left, right)
                .await
                .unwrap()
        );

        drop(one);
        server.expire_session(doomed_session.session_id());
        assert!(
            gap_fully_abandoned(&session, &paths, partition(), left, right)
                .await
                .unwrap()
        );

        // A released (vanished) number inside the gap blocks the merge.
        assert!(
            !gap_fully_abandoned(
                &session,
                &paths,
                partition(),
                BlockNumber::new(0),
                BlockNumber::new(5)
            )
            .await
            .unwrap()
        );
    }

    #[test_log::test(tokio::test)]
    async fn mark_abandoned_creates_empty_node() {
        let (_server, session, paths) = setup().await;
        let n = BlockNumber::new(9);
        mark_abandoned(&session, &paths, partition(), n).await.unwrap();
        mark_abandoned(&session, &paths, partition(), n).await.unwrap();
        assert_eq!(
            check_block(&session, &paths, partition(), n).await.unwrap(),
            BlockLockState::Abandoned
        );
    }
}
