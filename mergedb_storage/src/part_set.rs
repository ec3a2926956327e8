//! The set of active parts, the unit of visibility for reads.
//!
//! Readers grab an `Arc<PartsSnapshot>` and keep scanning it unaffected by
//! concurrent commits. Writers clone the snapshot, mutate the clone and swap
//! it in. Superseded parts go to a retired list and stay on disk until no
//! snapshot references them anymore.

use crate::part::DataPart;
use crate::{Error, Result};
use mergedb_types::{BlockNumber, PartName, PartitionId};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// An immutable view of the active parts, keyed by partition and the left
/// bound of each part's block range. Active parts never overlap, so within a
/// partition the left bound orders them completely.
#[derive(Debug, Default, Clone)]
pub struct PartsSnapshot {
    by_partition: BTreeMap<PartitionId, BTreeMap<BlockNumber, Arc<DataPart>>>,
}

impl PartsSnapshot {
    pub fn iter(&self) -> impl Iterator<Item = &Arc<DataPart>> {
        self.by_partition.values().flat_map(|parts| parts.values())
    }

    pub fn len(&self) -> usize {
        self.by_partition.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_partition.is_empty()
    }

    pub fn part_names(&self) -> Vec<PartName> {
        self.iter().map(|p| p.name()).collect()
    }

    pub fn partitions(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.by_partition.keys().copied()
    }

    pub fn parts_in_partition(&self, partition: PartitionId) -> Vec<Arc<DataPart>> {
        self.by_partition
            .get(&partition)
            .map(|parts| parts.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, name: &PartName) -> Option<&Arc<DataPart>> {
        self.by_partition
            .get(&name.partition())
            .and_then(|parts| parts.get(&name.left))
            .filter(|p| p.name() == *name)
    }

    /// The active part whose block range covers `name`, if any. Exact matches
    /// count: a part covers itself.
    pub fn covering(&self, name: &PartName) -> Option<&Arc<DataPart>> {
        let parts = self.by_partition.get(&name.partition())?;
        parts
            .range(..=name.left)
            .next_back()
            .map(|(_, p)| p)
            .filter(|p| p.name().contains(name))
    }
}

/// What happened to the active set when a part was added.
#[derive(Debug)]
pub enum AddOutcome {
    /// The part is now active; the listed parts were superseded and retired.
    Added { superseded: Vec<Arc<DataPart>> },
    /// An active part already covers the added one; the set is unchanged.
    Covered(PartName),
}

#[derive(Debug, Default)]
pub struct ActivePartSet {
    current: RwLock<Arc<PartsSnapshot>>,
    /// Parts no longer active but possibly still referenced by snapshots.
    retired: Mutex<Vec<Arc<DataPart>>>,
}

impl ActivePartSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<PartsSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Make `part` active, retiring every active part its block range covers.
    pub fn add_part(&self, part: Arc<DataPart>) -> Result<AddOutcome> {
        let name = part.name();
        let mut current = self.current.write();

        if let Some(covering) = current.covering(&name) {
            warn!(part = %name, covering = %covering.name(), "part already covered, not adding");
            return Ok(AddOutcome::Covered(covering.name()));
        }

        let mut next = PartsSnapshot::clone(&current);
        let partition = next.by_partition.entry(name.partition()).or_default();

        let mut superseded = Vec::new();
        for existing in partition.values() {
            let other = existing.name();
            if name.contains(&other) {
                superseded.push(Arc::clone(existing));
            } else if !name.disjoint(&other) {
                return Err(Error::PartsOverlap {
                    new: name,
                    existing: other,
                });
            }
        }
        for old in &superseded {
            partition.remove(&old.name().left);
        }
        partition.insert(name.left, part);

        *current = Arc::new(next);
        self.retired.lock().extend(superseded.iter().cloned());
        Ok(AddOutcome::Added { superseded })
    }

    /// Remove every active part covered by `cover` and return them. The parts
    /// are NOT retired; the caller detaches or retires them explicitly.
    pub fn remove_covered(&self, cover: &PartName) -> Vec<Arc<DataPart>> {
        let mut current = self.current.write();
        let mut next = PartsSnapshot::clone(&current);
        let mut removed = Vec::new();
        if let Some(partition) = next.by_partition.get_mut(&cover.partition()) {
            partition.retain(|_, p| {
                if cover.contains(&p.name()) {
                    removed.push(Arc::clone(p));
                    false
                } else {
                    true
                }
            });
            if partition.is_empty() {
                next.by_partition.remove(&cover.partition());
            }
        }
        if !removed.is_empty() {
            *current = Arc::new(next);
        }
        removed
    }

    /// Remove one exact part from the active set, e.g. when the part checker
    /// quarantines it. Returns the part if it was active.
    pub fn remove(&self, name: &PartName) -> Option<Arc<DataPart>> {
        let mut current = self.current.write();
        current.get(name)?;
        let mut next = PartsSnapshot::clone(&current);
        let partition = next.by_partition.get_mut(&name.partition())?;
        let removed = partition.remove(&name.left);
        if partition.is_empty() {
            next.by_partition.remove(&name.partition());
        }
        *current = Arc::new(next);
        removed
    }

    /// Swap in an updated copy of an already-active part (same name), e.g.
    /// after an ALTER rewrote its manifests. No-op if the name is not active.
    pub fn replace(&self, part: Arc<DataPart>) {
        let name = part.name();
        let mut current = self.current.write();
        if current.get(&name).is_none() {
            return;
        }
        let mut next = PartsSnapshot::clone(&current);
        if let Some(partition) = next.by_partition.get_mut(&name.partition()) {
            partition.insert(name.left, part);
        }
        *current = Arc::new(next);
    }

    pub fn retire(&self, parts: impl IntoIterator<Item = Arc<DataPart>>) {
        self.retired.lock().extend(parts);
    }

    /// Retired parts no snapshot references anymore, ready to unlink.
    pub fn take_removable(&self) -> Vec<Arc<DataPart>> {
        let mut retired = self.retired.lock();
        let mut removable = Vec::new();
        retired.retain(|p| {
            if Arc::strong_count(p) == 1 {
                removable.push(Arc::clone(p));
                false
            } else {
                true
            }
        });
        // retain kept an extra clone alive inside `removable`; count 2 there
        // still means nobody outside holds the part.
        removable
    }

    pub fn retired_len(&self) -> usize {
        self.retired.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use mergedb_types::PartChecksums;
    use std::path::PathBuf;

    fn part(name: &str) -> Arc<DataPart> {
        let name: PartName = name.parse().unwrap();
        Arc::new(DataPart::assemble(
            name,
            PathBuf::from(name.to_string()),
            vec![],
            0,
            PartChecksums::default(),
            vec![],
        ))
    }

    #[test]
    fn add_supersedes_covered_parts() {
        let set = ActivePartSet::new();
        set.add_part(part("20140101_20140110_1_1_0")).unwrap();
        set.add_part(part("20140111_20140120_2_2_0")).unwrap();
        set.add_part(part("20140201_20140205_3_3_0")).unwrap();

        let outcome = set.add_part(part("20140101_20140120_1_2_1")).unwrap();
        let AddOutcome::Added { superseded } = outcome else {
            panic!("expected Added");
        };
        assert_eq!(superseded.len(), 2);

        let snap = set.snapshot();
        assert_eq!(snap.len(), 2);
        assert!(snap.get(&"20140101_20140120_1_2_1".parse().unwrap()).is_some());
        assert!(snap.get(&"20140101_20140110_1_1_0".parse().unwrap()).is_none());
    }

    #[test]
    fn covered_part_is_not_added() {
        let set = ActivePartSet::new();
        set.add_part(part("20140101_20140120_1_5_2")).unwrap();
        let outcome = set.add_part(part("20140102_20140103_2_3_1")).unwrap();
        assert!(matches!(outcome, AddOutcome::Covered(_)));
        assert_eq!(set.snapshot().len(), 1);
    }

    #[test]
    fn partial_overlap_is_refused() {
        let set = ActivePartSet::new();
        set.add_part(part("20140101_20140110_1_5_1")).unwrap();
        let err = set.add_part(part("20140101_20140110_4_8_1")).unwrap_err();
        assert!(matches!(err, Error::PartsOverlap { .. }));
    }

    #[test]
    fn snapshots_are_stable_across_commits() {
        let set = ActivePartSet::new();
        set.add_part(part("20140101_20140110_1_1_0")).unwrap();
        let before = set.snapshot();
        set.add_part(part("20140111_20140112_2_2_0")).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(set.snapshot().len(), 2);
    }

    #[test]
    fn remove_covered_takes_the_range() {
        let set = ActivePartSet::new();
        set.add_part(part("20140101_20140110_1_1_0")).unwrap();
        set.add_part(part("20140111_20140120_2_2_0")).unwrap();
        set.add_part(part("20140201_20140210_3_3_0")).unwrap();

        let partition: PartitionId = "201401".parse().unwrap();
        let cover = PartName::cover_range(partition, BlockNumber::new(0), BlockNumber::new(10));
        let removed = set.remove_covered(&cover);
        assert_eq!(removed.len(), 2);
        assert_eq!(set.snapshot().len(), 1);
    }

    #[test]
    fn retired_parts_become_removable_when_unreferenced() {
        let set = ActivePartSet::new();
        set.add_part(part("20140101_20140110_1_1_0")).unwrap();
        let held = set.snapshot();
        set.add_part(part("20140101_20140110_1_1_1")).unwrap();

        assert_eq!(set.retired_len(), 1);
        assert!(set.take_removable().is_empty());
        drop(held);
        assert_eq!(set.take_removable().len(), 1);
        assert_eq!(set.retired_len(), 0);
    }

    #[test]
    fn covering_lookup() {
        let set = ActivePartSet::new();
        set.add_part(part("20140101_20140120_2_6_3")).unwrap();
        let snap = set.snapshot();
        assert!(snap.covering(&"20140105_20140106_3_4_1".parse().unwrap()).is_some());
        assert!(snap.covering(&"20140105_20140106_7_7_0".parse().unwrap()).is_none());
        assert!(snap.covering(&"20140105_20140106_1_3_0".parse().unwrap()).is_none());
    }
}
