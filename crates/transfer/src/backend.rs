use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use batchpull_model::FileRecord;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::StoreError;

/// Where a tracker keeps its records between runs.
pub trait StateBackend: Send + Sync {
    /// Loads the persisted map, or an empty one if nothing was stored yet.
    fn load(&self) -> Result<BTreeMap<String, FileRecord>, StoreError>;

    /// Durably replaces the stored map.
    fn persist(&self, records: &BTreeMap<String, FileRecord>) -> Result<(), StoreError>;

    /// Removes the stored state.
    fn clear(&self) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// JSON file backend
// ---------------------------------------------------------------------------

/// Stores the whole record map as one pretty-printed JSON file.
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateBackend for JsonFileBackend {
    fn load(&self) -> Result<BTreeMap<String, FileRecord>, StoreError> {
        let records: BTreeMap<String, FileRecord> = read_json(&self.path)?.unwrap_or_default();
        debug!(path = %self.path.display(), count = records.len(), "loaded file state");
        Ok(records)
    }

    fn persist(&self, records: &BTreeMap<String, FileRecord>) -> Result<(), StoreError> {
        write_json_atomic(&self.path, records)
    }

    fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Keeps state in memory only. Used by tests and dry runs.
#[derive(Default)]
pub struct MemoryBackend {
    stored: Mutex<BTreeMap<String, FileRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateBackend for MemoryBackend {
    fn load(&self) -> Result<BTreeMap<String, FileRecord>, StoreError> {
        Ok(self
            .stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn persist(&self, records: &BTreeMap<String, FileRecord>) -> Result<(), StoreError> {
        *self.stored.lock().unwrap_or_else(PoisonError::into_inner) = records.clone();
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

/// Reads a JSON document, returning `None` if the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let data = match fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&data)?))
}

/// Writes `value` as JSON through a synced temporary file and a rename, so
/// readers only ever see the previous or the new document.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    {
        let file = File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.write_all(b"\n")?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
