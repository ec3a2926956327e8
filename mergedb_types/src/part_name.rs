use crate::BlockNumber;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

/// The coarse time bucket that scopes merges: one calendar month.
///
/// Text form is `YYYYMM`. Parts never span partitions and merges never cross
/// them.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct PartitionId {
    year: i32,
    month: u32,
}

impl PartitionId {
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// First day of the month.
    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).expect("valid partition month")
    }

    /// Last day of the month.
    pub fn last_day(&self) -> NaiveDate {
        let (y, m) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        NaiveDate::from_ymd_opt(y, m, 1)
            .expect("valid partition month")
            .pred_opt()
            .expect("month has a last day")
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}{:02}", self.year, self.month)
    }
}

impl FromStr for PartitionId {
    type Err = PartNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PartNameError::BadPartition(s.to_string()));
        }
        let year: i32 = s[..4].parse().expect("digits");
        let month: u32 = s[4..].parse().expect("digits");
        if !(1..=12).contains(&month) {
            return Err(PartNameError::BadPartition(s.to_string()));
        }
        Ok(Self { year, month })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PartNameError {
    #[error("invalid part name: {0}")]
    BadName(String),

    #[error("invalid partition id: {0}")]
    BadPartition(String),
}

/// Deterministic identity of a data part.
///
/// Text form is `YYYYMMDD_YYYYMMDD_<left>_<right>_<level>`: the min and max
/// dates of rows inside, the inclusive block-number range covered, and the
/// number of merges that produced it (0 = freshly written).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(into = "String", try_from = "String")]
pub struct PartName {
    pub min_date: NaiveDate,
    pub max_date: NaiveDate,
    pub left: BlockNumber,
    pub right: BlockNumber,
    pub level: u32,
}

impl PartName {
    pub fn new(
        min_date: NaiveDate,
        max_date: NaiveDate,
        left: BlockNumber,
        right: BlockNumber,
        level: u32,
    ) -> Self {
        Self {
            min_date,
            max_date,
            left,
            right,
            level,
        }
    }

    /// Name for a part covering a single freshly allocated block number.
    pub fn level_zero(min_date: NaiveDate, max_date: NaiveDate, block: BlockNumber) -> Self {
        Self::new(min_date, max_date, block, block, 0)
    }

    /// A synthetic name covering the block range `[left, right]` of a whole
    /// partition. Used as the target of DROP_RANGE entries: it names no real
    /// part, but `contains` every part in the range.
    pub fn cover_range(partition: PartitionId, left: BlockNumber, right: BlockNumber) -> Self {
        Self::new(
            partition.first_day(),
            partition.last_day(),
            left,
            right,
            u32::MAX,
        )
    }

    pub fn partition(&self) -> PartitionId {
        PartitionId::from_date(self.min_date)
    }

    /// Whether this part's range covers `other` (supersedes it).
    pub fn contains(&self, other: &PartName) -> bool {
        self.partition() == other.partition()
            && self.left <= other.left
            && self.right >= other.right
            && self.level >= other.level
    }

    /// Whether the two block ranges cannot share any number.
    pub fn disjoint(&self, other: &PartName) -> bool {
        self.partition() != other.partition()
            || self.right < other.left
            || other.right < self.left
    }

    /// Name of the part a merge of `parts` would produce. `parts` must be
    /// non-empty, sorted by `left` and all in one partition.
    pub fn merged(parts: &[PartName]) -> Self {
        let first = parts.first().expect("merge of at least one part");
        let last = parts.last().expect("merge of at least one part");
        Self::new(
            parts.iter().map(|p| p.min_date).min().expect("non-empty"),
            parts.iter().map(|p| p.max_date).max().expect("non-empty"),
            first.left,
            last.right,
            1 + parts.iter().map(|p| p.level).max().expect("non-empty"),
        )
    }
}

impl Display for PartName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}_{}",
            self.min_date.format("%Y%m%d"),
            self.max_date.format("%Y%m%d"),
            self.left,
            self.right,
            self.level
        )
    }
}

impl FromStr for PartName {
    type Err = PartNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || PartNameError::BadName(s.to_string());
        let mut it = s.split('_');
        let min_date = NaiveDate::parse_from_str(it.next().ok_or_else(bad)?, "%Y%m%d")
            .map_err(|_| bad())?;
        let max_date = NaiveDate::parse_from_str(it.next().ok_or_else(bad)?, "%Y%m%d")
            .map_err(|_| bad())?;
        let left: u64 = it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let right: u64 = it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let level: u32 = it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        if it.next().is_some() || left > right {
            return Err(bad());
        }
        Ok(Self::new(
            min_date,
            max_date,
            BlockNumber::new(left),
            BlockNumber::new(right),
            level,
        ))
    }
}

impl From<PartName> for String {
    fn from(name: PartName) -> Self {
        name.to_string()
    }
}

impl TryFrom<String> for PartName {
    type Error = PartNameError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}
