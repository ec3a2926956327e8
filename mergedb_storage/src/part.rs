//! One immutable on-disk data part.
//!
//! Layout inside the part directory: one `<column>.bin` file per column, a
//! `primary.idx` sparse index (one key tuple every `index_granularity` rows),
//! a `checksums.json` manifest covering every other file, and a
//! `columns.json` manifest naming the columns the part was written with.
//! Files are written once into a `tmp_`-prefixed directory and renamed into
//! place; nothing is ever modified in place.

use crate::{Error, Result, encode};
use mergedb_types::{ColumnSpec, ColumnType, PartChecksums, PartName, Row, TableSchema};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

pub const CHECKSUMS_FILE: &str = "checksums.json";
pub const COLUMNS_FILE: &str = "columns.json";
pub const PRIMARY_INDEX_FILE: &str = "primary.idx";

/// Directory parts are moved to when detached or quarantined.
pub const DETACHED_DIR: &str = "detached";

/// Directory holding parts written outside replication, attachable later.
pub const UNREPLICATED_DIR: &str = "unreplicated";

pub fn column_file_name(column: &str) -> String {
    format!("{column}.bin")
}

#[derive(Debug)]
pub struct DataPart {
    name: PartName,
    dir: PathBuf,
    columns: Vec<ColumnSpec>,
    rows: u64,
    checksums: PartChecksums,
    /// Sparse primary-key index: the key tuple of every
    /// `index_granularity`-th row.
    index: Vec<Row>,
    modification_time: SystemTime,
}

impl DataPart {
    pub(crate) fn assemble(
        name: PartName,
        dir: PathBuf,
        columns: Vec<ColumnSpec>,
        rows: u64,
        checksums: PartChecksums,
        index: Vec<Row>,
    ) -> Self {
        Self {
            name,
            dir,
            columns,
            rows,
            checksums,
            index,
            modification_time: SystemTime::now(),
        }
    }

    /// Load a part that already sits at `<table_dir>/<name>`.
    pub fn load(table_dir: &Path, name: PartName, schema: &TableSchema) -> Result<Self> {
        Self::load_from_dir(table_dir.join(name.to_string()), name, schema)
    }

    /// Load a part from an explicit directory, e.g. a fetch staging dir.
    pub fn load_from_dir(dir: PathBuf, name: PartName, schema: &TableSchema) -> Result<Self> {
        let columns: Vec<ColumnSpec> = read_manifest(&dir.join(COLUMNS_FILE))?;
        let checksums: PartChecksums = read_manifest(&dir.join(CHECKSUMS_FILE))?;

        let key_types: Vec<ColumnType> = schema
            .primary_key
            .iter()
            .map(|k| {
                columns
                    .iter()
                    .find(|c| &c.name == k)
                    .map(|c| c.ty)
                    .ok_or_else(|| Error::Corrupt {
                        part: name.to_string(),
                        reason: format!("key column {k} missing from columns manifest"),
                    })
            })
            .collect::<Result<_>>()?;

        let date_file = dir.join(column_file_name(&schema.date_column));
        let date_len = std::fs::metadata(&date_file)
            .map_err(|e| Error::io(&date_file, e))?
            .len();
        let rows = date_len / 4;

        let index = load_index(&dir.join(PRIMARY_INDEX_FILE), &key_types)?;

        let modification_time = std::fs::metadata(&dir)
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| SystemTime::now());

        Ok(Self {
            name,
            dir,
            columns,
            rows,
            checksums,
            index,
            modification_time,
        })
    }

    pub fn name(&self) -> PartName {
        self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn bytes(&self) -> u64 {
        self.checksums.total_bytes()
    }

    pub fn checksums(&self) -> &PartChecksums {
        &self.checksums
    }

    pub fn index(&self) -> &[Row] {
        &self.index
    }

    pub fn modification_time(&self) -> SystemTime {
        self.modification_time
    }

    pub fn level(&self) -> u32 {
        self.name.level
    }

    /// Recompute every file checksum and compare with the manifest.
    pub fn verify_checksums(&self) -> Result<()> {
        let actual = compute_checksums(&self.dir, self.checksums.files.keys())?;
        match self.checksums.first_mismatch(&actual) {
            None => Ok(()),
            Some(detail) => Err(Error::ChecksumMismatch {
                part: self.name.to_string(),
                detail,
            }),
        }
    }

    /// Move the part directory from its `tmp_` staging location into place.
    pub fn commit_rename(&mut self, table_dir: &Path) -> Result<()> {
        let target = table_dir.join(self.name.to_string());
        std::fs::rename(&self.dir, &target).map_err(|e| Error::io(&self.dir, e))?;
        debug!(part = %self.name, "renamed part into place");
        self.dir = target;
        Ok(())
    }

    /// Rename the part directory into `<table_dir>/detached/<prefix><name>`.
    /// Used both for DROP ... DETACH and for quarantining broken parts.
    pub fn detach(&self, table_dir: &Path, prefix: &str) -> Result<()> {
        let detached = table_dir.join(DETACHED_DIR);
        std::fs::create_dir_all(&detached).map_err(|e| Error::io(&detached, e))?;
        let target = detached.join(format!("{prefix}{}", self.name));
        std::fs::rename(&self.dir, &target).map_err(|e| Error::io(&self.dir, e))
    }

    /// Drop columns from the part on disk: unlink their files and rewrite
    /// both manifests. Key and date columns are never dropped; schema
    /// validation upstream guarantees that. Returns the updated part to swap
    /// into the active set in place of this one.
    pub fn with_columns_dropped(&self, dropped: &[String]) -> Result<Self> {
        let mut columns = self.columns.clone();
        let mut checksums = self.checksums.clone();
        for name in dropped {
            columns.retain(|c| &c.name != name);
            let file = column_file_name(name);
            checksums.files.remove(&file);
            let path = self.dir.join(&file);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(&path, e)),
            }
        }

        write_manifest(&self.dir.join(COLUMNS_FILE), &columns)?;
        let (size, crc32) = file_checksum(&self.dir.join(COLUMNS_FILE))?;
        checksums.add(COLUMNS_FILE, size, crc32);
        write_manifest(&self.dir.join(CHECKSUMS_FILE), &checksums)?;

        Ok(Self {
            name: self.name,
            dir: self.dir.clone(),
            columns,
            rows: self.rows,
            checksums,
            index: self.index.clone(),
            modification_time: SystemTime::now(),
        })
    }

    pub fn remove_from_disk(&self) -> Result<()> {
        std::fs::remove_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))
    }

    /// Read one whole file of the part (used by the part sender).
    pub fn read_file(&self, file_name: &str) -> Result<Vec<u8>> {
        let path = self.dir.join(file_name);
        std::fs::read(&path).map_err(|e| Error::io(&path, e))
    }

    /// Every file belonging to the part, manifest included.
    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.checksums.files.keys().cloned().collect();
        names.push(CHECKSUMS_FILE.to_string());
        names
    }
}

pub(crate) fn read_manifest<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::Manifest {
        path: path.to_path_buf(),
        source: e,
    })
}

pub(crate) fn write_manifest<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| Error::Manifest {
        path: path.to_path_buf(),
        source: e,
    })?;
    std::fs::write(path, bytes).map_err(|e| Error::io(path, e))
}

pub(crate) fn file_checksum(path: &Path) -> Result<(u64, u32)> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = crc32fast::Hasher::new();
    let mut size = 0u64;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).map_err(|e| Error::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hasher.finalize()))
}

pub(crate) fn compute_checksums<'a>(
    dir: &Path,
    files: impl Iterator<Item = &'a String>,
) -> Result<PartChecksums> {
    let mut checksums = PartChecksums::default();
    for name in files {
        let path = dir.join(name);
        match file_checksum(&path) {
            Ok((size, crc32)) => checksums.add(name.clone(), size, crc32),
            // A missing file is reported as a manifest mismatch, not io.
            Err(Error::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(checksums)
}

fn load_index(path: &Path, key_types: &[ColumnType]) -> Result<Vec<Row>> {
    let len = std::fs::metadata(path).map_err(|e| Error::io(path, e))?.len();
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut reader = CountingReader {
        inner: BufReader::new(file),
        consumed: 0,
    };

    let mut index = Vec::new();
    while reader.consumed < len {
        let mut mark = Row::with_capacity(key_types.len());
        for ty in key_types {
            mark.push(encode::read_value(&mut reader, *ty, path)?);
        }
        index.push(mark);
    }
    Ok(index)
}

struct CountingReader<R> {
    inner: R,
    consumed: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed += n as u64;
        Ok(n)
    }
}
