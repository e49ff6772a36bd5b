use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::catch_not_found;

/// The persisted metadata of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    /// When the entry was last used, in milliseconds since the Unix epoch.
    /// `0` means never.
    pub last_used_at: u64,
    /// Hex SHA-256 of the stored artifact. Diagnostics only, never used for
    /// freshness decisions.
    pub fingerprint: Option<String>,
}

/// The metadata store backing all cache entries.
///
/// Records live in memory and are mirrored to a single JSON file which is
/// rewritten atomically on every mutation. A missing file on startup and a
/// missing key both mean "never cached". Without a configured path the store
/// is memory-only, which effectively disables caching across restarts.
#[derive(Debug)]
pub struct MetaDb {
    path: Option<PathBuf>,
    records: Mutex<BTreeMap<String, EntryRecord>>,
}

impl MetaDb {
    /// Opens the store, loading existing records from `path` if present.
    pub fn open(path: Option<PathBuf>) -> io::Result<Self> {
        let records = match &path {
            Some(path) => match catch_not_found(|| std::fs::read(path))? {
                Some(bytes) => serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
                None => BTreeMap::new(),
            },
            None => BTreeMap::new(),
        };

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn get(&self, key: &str) -> Option<EntryRecord> {
        self.records.lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: String, record: EntryRecord) -> io::Result<()> {
        let mut records = self.records.lock().unwrap();
        records.insert(key, record);
        self.persist(&records)
    }

    pub fn remove(&self, key: &str) -> io::Result<()> {
        let mut records = self.records.lock().unwrap();
        records.remove(key);
        self.persist(&records)
    }

    /// All keys currently known to the store.
    pub fn keys(&self) -> Vec<String> {
        self.records.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrites the backing file. Must be called with the record lock held so
    /// that file contents always match some consistent in-memory state.
    fn persist(&self, records: &BTreeMap<String, EntryRecord>) -> io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let parent = path.parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "no parent directory for metadata")
        })?;
        std::fs::create_dir_all(parent)?;

        let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer(temp_file.as_file_mut(), records)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        temp_file.as_file_mut().flush()?;
        temp_file.persist(path).map_err(|e| e.error)?;

        Ok(())
    }
}
