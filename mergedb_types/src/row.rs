use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// A single column value.
///
/// The variant set is deliberately small: enough to carry a date column, key
/// columns and payload columns through the write, merge and replication
/// machinery. Ordering is derived, so rows sort by key tuples without any
/// per-type dispatch; mixed-type comparisons cannot happen for blocks that
/// passed schema validation.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Value {
    UInt64(u64),
    Int64(i64),
    Date(NaiveDate),
    String(String),
}

impl Value {
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UInt64(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Date(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v}"),
        }
    }
}

/// One table row, values in schema column order.
pub type Row = Vec<Value>;

/// A batch of rows handed to the write path. Row-major: the write path sorts
/// and splits whole rows before anything is laid out column-wise on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Block {
    pub rows: Vec<Row>,
}

impl Block {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}
