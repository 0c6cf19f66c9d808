//! The compiled-resource record store (C2): a persistent, keyed log of the last successful
//! compile of each resource.
//!
//! All mutation happens on the scheduler thread; the up-to-date evaluator reads from worker
//! threads via [`RecordStore::snapshot`], which copies the record out under a short lock so
//! no reader ever blocks the scheduler for long.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::id::ResourceId;

const FORMAT_MAGIC: &str = "resource-build-server-record-store/v1";

/// One row of the record store: the fingerprint of the inputs that produced the compiled
/// artifact the server currently believes is valid for a [`ResourceId`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledResourceRecord {
    pub compiler_version: i32,
    /// Hash over the source file's and each compile-dependency's modified-time.
    pub source_timestamp_hash: u64,
    pub install_dependencies: Vec<ResourceId>,
    /// Seconds since the Unix epoch.
    pub last_success_time: u64,
}

impl CompiledResourceRecord {
    pub fn now() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStore {
    format: String,
    records: BTreeMap<ResourceId, CompiledResourceRecord>,
}

/// Keyed table of [`CompiledResourceRecord`]s, durable to a single file.
///
/// Writes are write-through: [`RecordStore::put`] fsyncs the whole table to disk before
/// returning, because the scheduler must not tell a client a compile succeeded until the
/// record that says so is actually durable (§8 invariant 2).
pub struct RecordStore {
    path: PathBuf,
    records: Mutex<BTreeMap<ResourceId, CompiledResourceRecord>>,
}

impl RecordStore {
    /// Loads the store from `path`. A missing file starts empty; a corrupt file is logged as
    /// a warning and also starts empty (`RecordStoreCorruption` is recoverable, never fatal).
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<PersistedStore>(&bytes) {
                Ok(store) if store.format == FORMAT_MAGIC => store.records,
                Ok(store) => {
                    tracing::warn!(
                        path = %path.display(),
                        found = %store.format,
                        "record store format mismatch, resetting to empty"
                    );
                    BTreeMap::new()
                }
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "record store is corrupt, resetting to empty");
                    BTreeMap::new()
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "failed to read record store, resetting to empty");
                BTreeMap::new()
            }
        };
        Self { path, records: Mutex::new(records) }
    }

    /// Reads a copy of the record for `id`, if any.
    pub fn get(&self, id: &ResourceId) -> Option<CompiledResourceRecord> {
        self.records.lock().get(id).cloned()
    }

    /// Overwrites the record for `id` and persists the whole table before returning.
    pub fn put(&self, id: ResourceId, record: CompiledResourceRecord) -> std::io::Result<()> {
        {
            let mut records = self.records.lock();
            records.insert(id, record);
        }
        self.persist()
    }

    /// Drops the record for `id`, e.g. because the compiled artifact was deleted or found
    /// corrupt.
    pub fn remove(&self, id: &ResourceId) -> std::io::Result<()> {
        {
            let mut records = self.records.lock();
            records.remove(id);
        }
        self.persist()
    }

    /// Number of records currently held, for diagnostics.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let store = PersistedStore { format: FORMAT_MAGIC.to_string(), records: self.records.lock().clone() };
        let body = serde_json::to_vec_pretty(&store).expect("record store always serializes");
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, body)?;
        fs::rename(&tmp_path, &self.path)
    }
}
