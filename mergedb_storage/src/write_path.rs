//! Turning an incoming block into per-partition, key-sorted row batches.
//!
//! Each batch becomes one level-0 part once the caller has a block number for
//! it. Block numbers come from the coordination layer, so this module stops
//! at the `PendingPart` boundary.

use crate::Result;
use chrono::NaiveDate;
use mergedb_types::{Block, PartitionId, Row, TableSchema};
use std::collections::BTreeMap;

/// Rows of one future level-0 part: a single partition, sorted by key.
#[derive(Debug)]
pub struct PendingPart {
    pub partition: PartitionId,
    pub min_date: NaiveDate,
    pub max_date: NaiveDate,
    pub rows: Vec<Row>,
}

/// Validate `block` against `schema` and split it into one `PendingPart` per
/// calendar month touched, each sorted by the primary key. The sort is
/// stable, so rows with equal keys keep their insertion order.
pub fn split_block_into_parts(block: Block, schema: &TableSchema) -> Result<Vec<PendingPart>> {
    schema.check_block(&block)?;

    let date_idx = schema.date_column_index();
    let key_indexes = schema.key_indexes();

    let mut by_partition: BTreeMap<PartitionId, Vec<Row>> = BTreeMap::new();
    for row in block.rows {
        let date = row[date_idx].as_date().expect("validated date column");
        by_partition
            .entry(PartitionId::from_date(date))
            .or_default()
            .push(row);
    }

    let mut pending = Vec::with_capacity(by_partition.len());
    for (partition, mut rows) in by_partition {
        rows.sort_by(|a, b| schema.key_cmp(&key_indexes, a, b));
        let dates = rows
            .iter()
            .map(|r| r[date_idx].as_date().expect("validated date column"));
        let min_date = dates.clone().min().expect("partition groups are non-empty");
        let max_date = dates.max().expect("partition groups are non-empty");
        pending.push(PendingPart {
            partition,
            min_date,
            max_date,
            rows,
        });
    }
    Ok(pending)
}
