//! Insert deduplication through content-hash block records.
//!
//! Every committed insert leaves a `blocks/<id>` node, created in the same
//! multi that registers the part, where `<id>` hashes the sorted rows of the
//! piece. A client retrying an insert after a lost acknowledgement produces
//! the same id, finds the record, and the write is dropped instead of
//! committed twice. Records expire: the cleanup loop removes them once they
//! outlive the dedup TTL, after which the same content inserts again.

use crate::paths::TablePaths;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use mergedb_keeper::{CreateMode, Keeper, Op};
use mergedb_types::{PartName, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Payload of one `blocks/<id>` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DedupRecord {
    pub(crate) part: PartName,
    pub(crate) create_time: DateTime<Utc>,
}

/// Content id of one sorted month piece. Depends only on the row data, so a
/// retried insert maps to the same id no matter which replica or block
/// number serves it.
pub(crate) fn block_content_id(rows: &[Row]) -> String {
    let payload = serde_json::to_vec(rows).expect("rows always serialize");
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&payload);
    format!("{:08x}-{:08x}", hasher.finalize(), payload.len() as u32)
}

/// The part a previous insert of the same content produced, if its record
/// still exists.
pub(crate) async fn find_duplicate(
    keeper: &Arc<dyn Keeper>,
    table: &TablePaths,
    id: &str,
) -> Result<Option<PartName>> {
    let path = table.block_hash(id);
    match keeper.try_get(&path).await? {
        Some((data, _)) => {
            let record: DedupRecord =
                serde_json::from_slice(&data).map_err(|e| Error::payload(&path, e))?;
            Ok(Some(record.part))
        }
        None => Ok(None),
    }
}

/// The op creating the dedup record, for inclusion in the insert commit
/// multi. A concurrent identical insert makes the multi fail with NodeExists
/// on this path; the caller treats that as a duplicate, not an error.
pub(crate) fn register_op(table: &TablePaths, id: &str, part: PartName) -> Op {
    let record = DedupRecord {
        part,
        create_time: Utc::now(),
    };
    Op::create(
        table.block_hash(id),
        serde_json::to_vec(&record).expect("dedup records always serialize"),
        CreateMode::Persistent,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use mergedb_types::Value;

    fn row(id: u64) -> Row {
        vec![
            Value::Date(NaiveDate::from_ymd_opt(2014, 1, 1).unwrap()),
            Value::UInt64(id),
        ]
    }

    #[test]
    fn id_depends_on_content_only() {
        let a = vec![row(1), row(2)];
        assert_eq!(block_content_id(&a), block_content_id(&a.clone()));
        assert_ne!(block_content_id(&a), block_content_id(&[row(1), row(3)]));
        assert_ne!(block_content_id(&a), block_content_id(&[row(1)]));
    }

    #[test]
    fn record_round_trip() {
        let record = DedupRecord {
            part: "20140101_20140101_0_0_0".parse().unwrap(),
            create_time: Utc::now(),
        };
        let json = serde_json::to_vec(&record).unwrap();
        let back: DedupRecord = serde_json::from_slice(&json).unwrap();
        assert_eq!(back.part, record.part);
    }
}
