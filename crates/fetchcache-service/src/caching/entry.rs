use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::config::Config;

use super::{CacheContents, CacheError, CacheKey, EntryRecord, MetaDb, catch_not_found};

/// Filesystem and metadata home of all cache entries.
///
/// Owns the artifact directory and the [`MetaDb`]; [`CacheEntry`] values hand
/// their mutations back to the store they were created from.
#[derive(Debug)]
pub struct CacheStore {
    db: MetaDb,
    artifact_dir: Option<PathBuf>,
    retain_for: Duration,
}

impl CacheStore {
    pub fn from_config(config: &Config) -> io::Result<Self> {
        // Artifact paths are handed out to consumers, so resolve them to
        // absolute form once.
        let artifact_dir = match config.downloads_path() {
            Some(dir) => {
                std::fs::create_dir_all(&dir)?;
                Some(dir.canonicalize()?)
            }
            None => None,
        };

        let db = MetaDb::open(config.metadata_path())?;

        Ok(Self {
            db,
            artifact_dir,
            retain_for: config.retain_for,
        })
    }

    /// Looks up `key`, reloading persisted fields when a record exists.
    ///
    /// The artifact file is probed as part of the lookup: a record without
    /// its file initializes as not-cached.
    pub fn entry(self: &Arc<Self>, key: CacheKey) -> CacheEntry {
        let path = self.artifact_path(&key);
        let record = self.db.get(&key.cache_path());
        let file_exists = path.as_deref().is_some_and(Path::exists);

        let mut entry = CacheEntry {
            store: self.clone(),
            key,
            path,
            is_cached: false,
            last_used_at: 0,
            fingerprint: None,
            pending: false,
            just_downloaded: false,
        };

        if let Some(record) = record {
            if file_exists {
                entry.is_cached = true;
                entry.last_used_at = record.last_used_at;
                entry.fingerprint = record.fingerprint;
            }
        }

        entry
    }

    pub(crate) fn db(&self) -> &MetaDb {
        &self.db
    }

    fn artifact_path(&self, key: &CacheKey) -> Option<PathBuf> {
        self.artifact_dir.as_ref().map(|dir| dir.join(key.cache_path()))
    }
}

/// The in-memory record of one cached resource.
///
/// `pending` and `just_downloaded` are request-scoped and never persisted.
#[derive(Debug)]
pub struct CacheEntry {
    store: Arc<CacheStore>,
    key: CacheKey,
    path: Option<PathBuf>,
    is_cached: bool,
    last_used_at: u64,
    fingerprint: Option<String>,
    pending: bool,
    just_downloaded: bool,
}

impl CacheEntry {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Absolute location of the artifact bytes, if caching is enabled.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_cached(&self) -> bool {
        self.is_cached
    }

    /// Milliseconds since the Unix epoch of the last use, `0` for never.
    pub fn last_used_at(&self) -> u64 {
        self.last_used_at
    }

    /// Hex SHA-256 of the stored bytes. Diagnostics only.
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    /// Whether a download for this entry is currently outstanding.
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Whether this entry was filled by the request that produced it, as
    /// opposed to being served from cache.
    pub fn just_downloaded(&self) -> bool {
        self.just_downloaded
    }

    pub(crate) fn set_pending(&mut self, pending: bool) {
        self.pending = pending;
    }

    pub(crate) fn mark_just_downloaded(&mut self) {
        self.just_downloaded = true;
    }

    /// Reports whether the entry has outlived the configured retention.
    ///
    /// With `invalidate`, the last-use timestamp is forced to zero and
    /// persisted first, so the entry reports expired from now on regardless
    /// of its actual age.
    pub fn expired(&mut self, invalidate: bool) -> CacheContents<bool> {
        if invalidate {
            self.last_used_at = 0;
            self.save()?;
        }

        let age = unix_millis().saturating_sub(self.last_used_at);
        Ok(age > self.store.retain_for.as_millis() as u64)
    }

    /// Sets the last-use timestamp to now and persists.
    pub fn touch(&mut self) -> CacheContents {
        self.last_used_at = unix_millis();
        self.save()
    }

    /// Persists `last_used_at` and `fingerprint` under this entry's key.
    ///
    /// This is the only path that marks an entry cached.
    pub fn save(&mut self) -> CacheContents {
        self.store.db.insert(
            self.key.cache_path(),
            EntryRecord {
                last_used_at: self.last_used_at,
                fingerprint: self.fingerprint.clone(),
            },
        )?;
        self.is_cached = true;

        Ok(())
    }

    /// Stores `bytes` as this entry's artifact and records the fingerprint.
    ///
    /// Success is decided by probing for the file afterwards, not by the
    /// write call's result: the write goes through a rename which is not
    /// trusted to report failures reliably on all filesystems.
    pub fn write(&mut self, bytes: &[u8]) -> CacheContents {
        let fingerprint = content_hash(bytes);

        let Some(path) = &self.path else {
            // Caching is disabled; the artifact only lives in memory for
            // this one request.
            self.fingerprint = Some(fingerprint);
            return Ok(());
        };

        if let Err(e) = write_atomic(path, bytes) {
            let dynerr: &dyn std::error::Error = &e;
            tracing::warn!(
                error = dynerr,
                path = %path.display(),
                "Failed to write cache artifact",
            );
        }

        if !path.exists() {
            return Err(CacheError::WriteFailed(path.display().to_string()));
        }

        self.fingerprint = Some(fingerprint);
        Ok(())
    }

    /// Deletes the artifact, removes the metadata record, and persists.
    pub fn expunge(&mut self) -> CacheContents {
        if let Some(path) = &self.path {
            catch_not_found(|| std::fs::remove_file(path))?;
        }
        self.store.db.remove(&self.key.cache_path())?;

        self.is_cached = false;
        self.fingerprint = None;
        self.last_used_at = 0;

        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::Other, "no parent directory for cache artifact")
    })?;
    std::fs::create_dir_all(parent)?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
    temp_file.as_file_mut().write_all(bytes)?;
    temp_file.persist(path).map_err(|e| e.error)?;

    Ok(())
}

fn content_hash(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut hash = String::with_capacity(64);
    for b in Sha256::digest(bytes) {
        hash.write_fmt(format_args!("{b:02x}")).unwrap();
    }
    hash
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
