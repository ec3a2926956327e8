//! Reading rows back out of parts.
//!
//! `PartReader` streams the rows of one part in key order, projected onto a
//! target schema: columns the part predates are filled with type defaults,
//! columns the part has but the schema dropped are not opened at all. The
//! merger drives the same reader.

use crate::part::{DataPart, column_file_name};
use crate::part_set::PartsSnapshot;
use crate::{Error, Result, encode};
use mergedb_types::{ColumnType, Row, TableSchema, Value};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

enum ColumnSource {
    File {
        reader: BufReader<File>,
        ty: ColumnType,
        path: PathBuf,
    },
    /// The part was written before this column existed.
    Default(Value),
}

impl std::fmt::Debug for ColumnSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File { path, .. } => f.debug_tuple("File").field(path).finish(),
            Self::Default(v) => f.debug_tuple("Default").field(v).finish(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct PartReader {
    columns: Vec<ColumnSource>,
    remaining: u64,
}

impl PartReader {
    pub(crate) fn open(part: &DataPart, schema: &TableSchema) -> Result<Self> {
        let mut columns = Vec::with_capacity(schema.columns.len());
        for spec in &schema.columns {
            let source = if part.columns().iter().any(|c| c.name == spec.name) {
                let path = part.dir().join(column_file_name(&spec.name));
                let file = File::open(&path).map_err(|e| Error::io(&path, e))?;
                ColumnSource::File {
                    reader: BufReader::new(file),
                    ty: spec.ty,
                    path,
                }
            } else {
                ColumnSource::Default(spec.ty.default_value())
            };
            columns.push(source);
        }
        Ok(Self {
            columns,
            remaining: part.rows(),
        })
    }

    pub(crate) fn next_row(&mut self) -> Result<Option<Row>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let mut row = Row::with_capacity(self.columns.len());
        for source in &mut self.columns {
            let value = match source {
                ColumnSource::File { reader, ty, path } => encode::read_value(reader, *ty, path)?,
                ColumnSource::Default(v) => v.clone(),
            };
            row.push(value);
        }
        Ok(Some(row))
    }
}

/// An inclusive range over primary-key tuples. `None` bounds are open.
#[derive(Debug, Clone, Default)]
pub struct KeyRange {
    pub from: Option<Row>,
    pub to: Option<Row>,
}

impl KeyRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(from: Option<Row>, to: Option<Row>) -> Self {
        Self { from, to }
    }

    fn contains(&self, key: &Row) -> bool {
        self.from.as_ref().map_or(true, |from| key >= from)
            && self.to.as_ref().map_or(true, |to| key <= to)
    }
}

/// Scan every active part in `snapshot` for rows whose key falls in `range`,
/// returned in key order. The sparse index bounds how far into each part the
/// scan decodes.
pub fn scan_parts(
    snapshot: &PartsSnapshot,
    schema: &TableSchema,
    range: &KeyRange,
) -> Result<Vec<Row>> {
    let key_indexes = schema.key_indexes();
    let granularity = schema.index_granularity as u64;
    let mut out = Vec::new();

    for part in snapshot.iter() {
        let marks = part.index();

        // Rows before the last mark below `from` cannot match; rows at or
        // past the first mark above `to` cannot match either.
        let skip_rows = match &range.from {
            Some(from) => {
                granularity * marks.partition_point(|m| m < from).saturating_sub(1) as u64
            }
            None => 0,
        };
        let end_rows = match &range.to {
            Some(to) => (granularity * marks.partition_point(|m| m <= to) as u64).min(part.rows()),
            None => part.rows(),
        };

        let mut reader = PartReader::open(part, schema)?;
        let mut row_idx = 0u64;
        while row_idx < end_rows {
            let Some(row) = reader.next_row()? else {
                return Err(Error::Corrupt {
                    part: part.name().to_string(),
                    reason: format!("column data ended at row {row_idx} of {}", part.rows()),
                });
            };
            if row_idx >= skip_rows {
                let key = schema.key_of(&key_indexes, &row);
                if range.contains(&key) {
                    out.push(row);
                }
            }
            row_idx += 1;
        }
    }

    out.sort_by(|a, b| schema.key_cmp(&key_indexes, a, b));
    Ok(out)
}
