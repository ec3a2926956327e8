//! Writing the files of a new part into a staging directory.

use crate::part::{
    COLUMNS_FILE, CHECKSUMS_FILE, DataPart, PRIMARY_INDEX_FILE, column_file_name,
    compute_checksums, write_manifest,
};
use crate::{Error, Result, encode};
use mergedb_types::{PartName, Row, TableSchema};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Streams rows (already in key order) into the files of one part. Both the
/// write path and the merger drive this; the merger never holds more than one
/// row per input in memory.
#[derive(Debug)]
pub struct PartWriter {
    name: PartName,
    dir: PathBuf,
    columns: Vec<(BufWriter<File>, PathBuf)>,
    specs: Vec<mergedb_types::ColumnSpec>,
    key_indexes: Vec<usize>,
    granularity: usize,
    idx_out: BufWriter<File>,
    idx_path: PathBuf,
    index: Vec<Row>,
    rows: u64,
}

impl PartWriter {
    /// Open the files of a new part under `staging_dir`. The caller renames
    /// the directory into the table directory once the part is committed.
    pub fn create(staging_dir: &Path, name: PartName, schema: &TableSchema) -> Result<Self> {
        std::fs::create_dir_all(staging_dir).map_err(|e| Error::io(staging_dir, e))?;

        let mut columns = Vec::with_capacity(schema.columns.len());
        for spec in &schema.columns {
            let path = staging_dir.join(column_file_name(&spec.name));
            let file = File::create(&path).map_err(|e| Error::io(&path, e))?;
            columns.push((BufWriter::new(file), path));
        }

        let idx_path = staging_dir.join(PRIMARY_INDEX_FILE);
        let idx_file = File::create(&idx_path).map_err(|e| Error::io(&idx_path, e))?;

        Ok(Self {
            name,
            dir: staging_dir.to_path_buf(),
            columns,
            specs: schema.columns.clone(),
            key_indexes: schema.key_indexes(),
            granularity: schema.index_granularity,
            idx_out: BufWriter::new(idx_file),
            idx_path,
            index: Vec::new(),
            rows: 0,
        })
    }

    pub fn push(&mut self, row: &Row) -> Result<()> {
        if self.rows as usize % self.granularity == 0 {
            let mark: Row = self.key_indexes.iter().map(|&i| row[i].clone()).collect();
            for value in &mark {
                encode::write_value(&mut self.idx_out, value, &self.idx_path)?;
            }
            self.index.push(mark);
        }
        for ((out, path), value) in self.columns.iter_mut().zip(row) {
            encode::write_value(out, value, path)?;
        }
        self.rows += 1;
        Ok(())
    }

    /// Flush everything, write the manifests and hand back the part, still in
    /// its staging directory.
    pub fn finish(mut self) -> Result<DataPart> {
        for (out, path) in &mut self.columns {
            out.flush().map_err(|e| Error::io(&*path, e))?;
        }
        self.idx_out.flush().map_err(|e| Error::io(&self.idx_path, e))?;

        write_manifest(&self.dir.join(COLUMNS_FILE), &self.specs)?;

        let mut covered: Vec<String> = self
            .specs
            .iter()
            .map(|c| column_file_name(&c.name))
            .collect();
        covered.push(PRIMARY_INDEX_FILE.to_string());
        covered.push(COLUMNS_FILE.to_string());
        let checksums = compute_checksums(&self.dir, covered.iter())?;
        write_manifest(&self.dir.join(CHECKSUMS_FILE), &checksums)?;

        debug!(part = %self.name, rows = self.rows, "wrote part files");

        Ok(DataPart::assemble(
            self.name,
            self.dir,
            self.specs,
            self.rows,
            checksums,
            self.index,
        ))
    }
}

/// Write a complete part from a slice of rows already sorted by the primary
/// key.
pub fn write_part_files(
    staging_dir: &Path,
    name: PartName,
    schema: &TableSchema,
    rows: &[Row],
) -> Result<DataPart> {
    let mut writer = PartWriter::create(staging_dir, name, schema)?;
    for row in rows {
        writer.push(row)?;
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use mergedb_types::{BlockNumber, ColumnSpec, ColumnType, Value};
    use pretty_assertions::assert_eq;

    fn schema() -> TableSchema {
        TableSchema::new(
            vec![
                ColumnSpec::new("date", ColumnType::Date),
                ColumnSpec::new("id", ColumnType::UInt64),
                ColumnSpec::new("payload", ColumnType::String),
            ],
            vec!["id".into()],
            "date",
            2,
        )
        .unwrap()
    }

    fn row(day: u32, id: u64, payload: &str) -> Row {
        vec![
            Value::Date(NaiveDate::from_ymd_opt(2014, 1, day).unwrap()),
            Value::UInt64(id),
            Value::String(payload.into()),
        ]
    }

    #[test]
    fn written_part_loads_back() {
        let schema = schema();
        let tmp = tempfile::tempdir().unwrap();
        let table_dir = tmp.path();
        let name = PartName::level_zero(
            NaiveDate::from_ymd_opt(2014, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2014, 1, 3).unwrap(),
            BlockNumber::new(7),
        );
        let rows = vec![row(1, 1, "a"), row(3, 2, "b"), row(2, 3, "c")];

        let staging = table_dir.join(format!("tmp_{name}"));
        let mut part = write_part_files(&staging, name, &schema, &rows).unwrap();
        assert_eq!(part.rows(), 3);
        // Granularity 2: marks at rows 0 and 2.
        assert_eq!(part.index().len(), 2);
        assert_eq!(part.index()[1], vec![Value::UInt64(3)]);

        part.commit_rename(table_dir).unwrap();
        let loaded = DataPart::load(table_dir, name, &schema).unwrap();
        assert_eq!(loaded.rows(), 3);
        assert_eq!(loaded.columns(), schema.columns.as_slice());
        assert_eq!(loaded.checksums(), part.checksums());
        assert_eq!(loaded.index(), part.index());
        loaded.verify_checksums().unwrap();
    }

    #[test]
    fn corruption_is_detected() {
        let schema = schema();
        let tmp = tempfile::tempdir().unwrap();
        let name = PartName::level_zero(
            NaiveDate::from_ymd_opt(2014, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2014, 1, 1).unwrap(),
            BlockNumber::new(1),
        );
        let dir = tmp.path().join(name.to_string());
        let part = write_part_files(&dir, name, &schema, &[row(1, 1, "a")]).unwrap();
        part.verify_checksums().unwrap();

        std::fs::write(dir.join(column_file_name("id")), vec![0xff; 8]).unwrap();
        let err = part.verify_checksums().unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }), "{err}");

        std::fs::remove_file(dir.join(column_file_name("payload"))).unwrap();
        let err = part.verify_checksums().unwrap_err();
        assert!(err.to_string().contains("payload.bin"), "{err}");
    }
}
