use crate::{Block, Row, SchemaVersion, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::Display;

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("unknown column: {0}")]
    UnknownColumn(String),

    #[error("row has {got} values, schema has {expected} columns")]
    WrongWidth { expected: usize, got: usize },

    #[error("column {column} expects {expected}, got value {got}")]
    TypeMismatch {
        column: String,
        expected: ColumnType,
        got: String,
    },

    #[error("date column {0} must have type Date")]
    BadDateColumn(String),

    #[error("primary key column {0} is not part of the schema")]
    BadKeyColumn(String),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    UInt64,
    Int64,
    Date,
    String,
}

impl ColumnType {
    pub fn matches(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Self::UInt64, Value::UInt64(_))
                | (Self::Int64, Value::Int64(_))
                | (Self::Date, Value::Date(_))
                | (Self::String, Value::String(_))
        )
    }

    /// Value used when reading a column added by ALTER from a part written
    /// before the column existed.
    pub fn default_value(&self) -> Value {
        match self {
            Self::UInt64 => Value::UInt64(0),
            Self::Int64 => Value::Int64(0),
            Self::Date => Value::Date(chrono::NaiveDate::default()),
            Self::String => Value::String(String::new()),
        }
    }
}

impl Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UInt64 => write!(f, "UInt64"),
            Self::Int64 => write!(f, "Int64"),
            Self::Date => write!(f, "Date"),
            Self::String => write!(f, "String"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub ty: ColumnType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// The table schema shared by all replicas via the coordination store.
///
/// `version` is bumped on every ALTER; replicas compare versions to know
/// whether their local parts are behind the shared column set.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnSpec>,
    /// Names of the columns forming the sort key, leftmost first.
    pub primary_key: Vec<String>,
    /// The Date column rows are partitioned by (into months).
    pub date_column: String,
    /// One sparse-index entry is written every this many rows.
    pub index_granularity: usize,
    pub version: SchemaVersion,
}

impl TableSchema {
    pub fn new(
        columns: Vec<ColumnSpec>,
        primary_key: Vec<String>,
        date_column: impl Into<String>,
        index_granularity: usize,
    ) -> Result<Self, SchemaError> {
        let schema = Self {
            columns,
            primary_key,
            date_column: date_column.into(),
            index_granularity,
            version: SchemaVersion::default(),
        };
        schema.validate()?;
        Ok(schema)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        let date_idx = self
            .column_index(&self.date_column)
            .ok_or_else(|| SchemaError::UnknownColumn(self.date_column.clone()))?;
        if self.columns[date_idx].ty != ColumnType::Date {
            return Err(SchemaError::BadDateColumn(self.date_column.clone()));
        }
        for key in &self.primary_key {
            if self.column_index(key).is_none() {
                return Err(SchemaError::BadKeyColumn(key.clone()));
            }
        }
        Ok(())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn date_column_index(&self) -> usize {
        self.column_index(&self.date_column)
            .expect("validated schema has its date column")
    }

    pub fn key_indexes(&self) -> Vec<usize> {
        self.primary_key
            .iter()
            .map(|k| self.column_index(k).expect("validated schema key column"))
            .collect()
    }

    /// The schema after an ALTER to `columns`, one version later. The sort
    /// key, date column and granularity are immutable for the table lifetime.
    pub fn with_columns(&self, columns: Vec<ColumnSpec>) -> Result<Self, SchemaError> {
        let next = Self {
            columns,
            primary_key: self.primary_key.clone(),
            date_column: self.date_column.clone(),
            index_granularity: self.index_granularity,
            version: self.version.next(),
        };
        next.validate()?;
        Ok(next)
    }

    /// Compare two rows by the sort key.
    pub fn key_cmp(&self, key_indexes: &[usize], a: &Row, b: &Row) -> Ordering {
        for &i in key_indexes {
            match a[i].cmp(&b[i]) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }

    /// Extract the sort-key tuple of a row.
    pub fn key_of(&self, key_indexes: &[usize], row: &Row) -> Row {
        key_indexes.iter().map(|&i| row[i].clone()).collect()
    }

    /// Check that every row in the block matches the column list.
    pub fn check_block(&self, block: &Block) -> Result<(), SchemaError> {
        for row in &block.rows {
            if row.len() != self.columns.len() {
                return Err(SchemaError::WrongWidth {
                    expected: self.columns.len(),
                    got: row.len(),
                });
            }
            for (spec, value) in self.columns.iter().zip(row) {
                if !spec.ty.matches(value) {
                    return Err(SchemaError::TypeMismatch {
                        column: spec.name.clone(),
                        expected: spec.ty,
                        got: value.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}
