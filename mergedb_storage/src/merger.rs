//! Selecting adjacent parts to merge and producing the merged part.
//!
//! Selection is a local policy decision; whether the chosen parts MAY merge
//! at all (block numbers in the gap between them, parts already promised to
//! other merges) is the caller's `can_merge` predicate. The merge itself is a
//! k-way streaming merge by sort key, one row per input in memory.

use crate::part::DataPart;
use crate::part_set::{ActivePartSet, PartsSnapshot};
use crate::reader::PartReader;
use crate::writer::PartWriter;
use crate::{Error, Result};
use mergedb_types::{PartName, Row, TableSchema};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy)]
pub struct MergeSettings {
    /// Pairs whose combined size exceeds this are never selected.
    pub max_total_bytes: u64,
    /// Minimum age of both parts for the size-based fallback selection.
    pub min_age_for_fallback: Duration,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            max_total_bytes: 100 * 1024 * 1024 * 1024,
            min_age_for_fallback: Duration::from_secs(300),
        }
    }
}

/// An adjacent pair chosen for merging, plus the name of the result.
#[derive(Debug, Clone)]
pub struct MergeSelection {
    pub parts: Vec<Arc<DataPart>>,
    pub result: PartName,
}

/// Pick an adjacent pair of active parts to merge. Prefers the pair sharing
/// the lowest level; falls back to the old-enough pair with the smallest
/// combined size. Returns `None` when nothing qualifies.
pub fn select_parts_to_merge(
    snapshot: &PartsSnapshot,
    settings: &MergeSettings,
    can_merge: &dyn Fn(&DataPart, &DataPart) -> bool,
) -> Option<MergeSelection> {
    let mut best_leveled: Option<(u32, u64, MergeSelection)> = None;
    let mut best_fallback: Option<(u64, MergeSelection)> = None;

    for partition in snapshot.partitions() {
        let parts = snapshot.parts_in_partition(partition);
        for pair in parts.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if !can_merge(a, b) {
                continue;
            }
            let bytes = a.bytes() + b.bytes();
            if bytes > settings.max_total_bytes {
                continue;
            }
            let selection = || MergeSelection {
                parts: vec![Arc::clone(a), Arc::clone(b)],
                result: PartName::merged(&[a.name(), b.name()]),
            };

            if a.level() == b.level() {
                let beats = best_leveled
                    .as_ref()
                    .is_none_or(|(lvl, sz, _)| (a.level(), bytes) < (*lvl, *sz));
                if beats {
                    best_leveled = Some((a.level(), bytes, selection()));
                }
            }

            let old_enough = [a, b].iter().all(|p| {
                p.modification_time()
                    .elapsed()
                    .map_or(false, |age| age >= settings.min_age_for_fallback)
            });
            if old_enough {
                let beats = best_fallback.as_ref().is_none_or(|(sz, _)| bytes < *sz);
                if beats {
                    best_fallback = Some((bytes, selection()));
                }
            }
        }
    }

    best_leveled
        .map(|(_, _, s)| s)
        .or(best_fallback.map(|(_, s)| s))
}

struct HeapEntry {
    key: Row,
    source: usize,
    row: Row,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Ties by source index keep rows with equal keys in input-part order.
        self.key
            .cmp(&other.key)
            .then(self.source.cmp(&other.source))
    }
}

/// Merge `parts` (sorted by left block number, one partition) into a new part
/// named `result`, written under `staging_dir`. Inputs are untouched; the
/// returned transaction commits or rolls back the output.
pub fn merge_parts(
    staging_dir: &Path,
    result: PartName,
    schema: &TableSchema,
    parts: &[Arc<DataPart>],
) -> Result<MergeTransaction> {
    let key_indexes = schema.key_indexes();
    let mut writer = PartWriter::create(staging_dir, result, schema)?;

    let mut readers = parts
        .iter()
        .map(|p| PartReader::open(p, schema))
        .collect::<Result<Vec<_>>>()?;

    let mut heap = BinaryHeap::with_capacity(readers.len());
    for (source, reader) in readers.iter_mut().enumerate() {
        if let Some(row) = reader.next_row()? {
            heap.push(Reverse(HeapEntry {
                key: schema.key_of(&key_indexes, &row),
                source,
                row,
            }));
        }
    }

    let mut rows = 0u64;
    while let Some(Reverse(entry)) = heap.pop() {
        writer.push(&entry.row)?;
        rows += 1;
        if let Some(row) = readers[entry.source].next_row()? {
            heap.push(Reverse(HeapEntry {
                key: schema.key_of(&key_indexes, &row),
                source: entry.source,
                row,
            }));
        }
    }

    let expected: u64 = parts.iter().map(|p| p.rows()).sum();
    if rows != expected {
        return Err(Error::Corrupt {
            part: result.to_string(),
            reason: format!("merge produced {rows} rows, inputs hold {expected}"),
        });
    }

    let part = writer.finish()?;
    info!(result = %result, inputs = parts.len(), rows, "merged parts");
    Ok(MergeTransaction { part: Some(part) })
}

/// A merged part sitting in its staging directory. `commit` renames it into
/// the table directory and swaps it into the active set; dropping the
/// transaction uncommitted deletes the staging directory and leaves the
/// inputs active.
#[derive(Debug)]
pub struct MergeTransaction {
    part: Option<DataPart>,
}

impl MergeTransaction {
    pub fn part_name(&self) -> PartName {
        self.part
            .as_ref()
            .expect("transaction holds its part until commit or drop")
            .name()
    }

    pub fn part(&self) -> &DataPart {
        self.part
            .as_ref()
            .expect("transaction holds its part until commit or drop")
    }

    /// Take the staged part out, defusing the rollback. The caller owns the
    /// staging directory from here on.
    pub fn into_inner(mut self) -> DataPart {
        self.part
            .take()
            .expect("transaction holds its part until commit or drop")
    }

    pub fn commit(mut self, table_dir: &Path, set: &ActivePartSet) -> Result<Arc<DataPart>> {
        let mut part = self
            .part
            .take()
            .expect("transaction holds its part until commit or drop");
        part.commit_rename(table_dir)?;
        let part = Arc::new(part);
        set.add_part(Arc::clone(&part))?;
        Ok(part)
    }
}

impl Drop for MergeTransaction {
    fn drop(&mut self) {
        if let Some(part) = self.part.take() {
            let _ = part.remove_from_disk();
        }
    }
}
