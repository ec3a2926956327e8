//! Shipping whole parts between replicas.
//!
//! [`PartExchange`] is the transport seam: ask a named replica for a part,
//! get its files and checksum manifest back. [`LocalPartExchange`] wires
//! replicas living in one process together, which is all the tests and any
//! embedded use need; a network transport implements the same trait
//! elsewhere.

use crate::Result;
use bytes::Bytes;
use hashbrown::HashMap;
use mergedb_storage::{ActivePartSet, DataPart};
use mergedb_types::{PartChecksums, PartName, TableSchema};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// A part as it travels between replicas: every file of the part directory
/// plus the manifest the receiver validates against.
#[derive(Debug, Clone)]
pub struct FetchedPart {
    pub name: PartName,
    pub checksums: PartChecksums,
    pub files: Vec<(String, Bytes)>,
}

#[async_trait::async_trait]
pub trait PartExchange: Send + Sync + std::fmt::Debug {
    /// Ask `replica` for `part` by exact name. `None` means the replica is
    /// reachable but does not serve that part.
    async fn fetch_part(&self, replica: &str, part: &PartName) -> Result<Option<FetchedPart>>;
}

/// In-process exchange: replicas register their active part set and serve
/// each other directly from disk.
#[derive(Debug, Default, Clone)]
pub struct LocalPartExchange {
    servers: Arc<Mutex<HashMap<String, Arc<ActivePartSet>>>>,
}

impl LocalPartExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, replica: impl Into<String>, parts: Arc<ActivePartSet>) {
        self.servers.lock().insert(replica.into(), parts);
    }

    pub fn deregister(&self, replica: &str) {
        self.servers.lock().remove(replica);
    }
}

#[async_trait::async_trait]
impl PartExchange for LocalPartExchange {
    async fn fetch_part(&self, replica: &str, part: &PartName) -> Result<Option<FetchedPart>> {
        let server = {
            let servers = self.servers.lock();
            servers.get(replica).map(Arc::clone)
        };
        let Some(server) = server else {
            return Ok(None);
        };
        let snapshot = server.snapshot();
        let Some(found) = snapshot.get(part) else {
            return Ok(None);
        };

        let mut files = Vec::new();
        for file in found.file_names() {
            let data = found.read_file(&file)?;
            files.push((file, Bytes::from(data)));
        }
        Ok(Some(FetchedPart {
            name: *part,
            checksums: found.checksums().clone(),
            files,
        }))
    }
}

/// Stage a fetched part under `tmp_fetch_<name>` and validate every file
/// against the shipped manifest. Returns the staged part; the caller renames
/// it into place once the keeper registration is in hand.
pub(crate) fn install_fetched_part(
    table_dir: &Path,
    schema: &TableSchema,
    fetched: FetchedPart,
) -> Result<DataPart> {
    let staging = table_dir.join(format!("tmp_fetch_{}", fetched.name));
    std::fs::create_dir_all(&staging)
        .map_err(|e| mergedb_storage::Error::Io { path: staging.clone(), source: e })?;

    for (file, data) in &fetched.files {
        let path = staging.join(file);
        std::fs::write(&path, data)
            .map_err(|e| mergedb_storage::Error::Io { path, source: e })?;
    }

    let part = match DataPart::load_from_dir(staging.clone(), fetched.name, schema)
        .and_then(|part| part.verify_checksums().map(|()| part))
    {
        Ok(part) => part,
        Err(e) => {
            warn!(part = %fetched.name, error = %e, "fetched part failed validation");
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e.into());
        }
    };

    if part.checksums() != &fetched.checksums {
        let detail = fetched
            .checksums
            .first_mismatch(part.checksums())
            .unwrap_or_else(|| "manifest disagreement".to_string());
        let _ = std::fs::remove_dir_all(&staging);
        return Err(mergedb_storage::Error::ChecksumMismatch {
            part: fetched.name.to_string(),
            detail,
        }
        .into());
    }

    info!(part = %part.name(), bytes = part.bytes(), "fetched part validated");
    Ok(part)
}
