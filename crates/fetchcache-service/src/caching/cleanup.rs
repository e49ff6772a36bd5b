use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;

use super::{CacheKey, CacheStore};

/// Entry function for the cleanup command.
///
/// This expunges expired cache entries, or all of them if `force` is set.
/// If `dry_run` is `true`, no files will actually be deleted.
pub fn cleanup(config: &Config, force: bool, dry_run: bool) -> Result<SweepStats> {
    let store = CacheStore::from_config(config).context("failed to open the cache store")?;
    Arc::new(store).sweep(force, dry_run)
}

/// The outcome of one sweep over the cache.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub retained_files: usize,
    pub retained_bytes: u64,
    pub expunged_files: usize,
    pub expunged_bytes: u64,
}

impl CacheStore {
    /// Expunges every expired cache entry, or every entry if `force` is set.
    ///
    /// This walks the metadata records, so artifacts that never made it into
    /// the metadata store are not considered, while records whose artifact
    /// file disappeared are cleaned up. The sweep is synchronous and does not
    /// interact with in-flight downloads.
    ///
    /// If `dry_run` is `true`, only reports what would be removed.
    pub fn sweep(self: &Arc<Self>, force: bool, dry_run: bool) -> Result<SweepStats> {
        tracing::info!("Sweeping the download cache");

        let mut stats = SweepStats::default();
        for hex in self.db().keys() {
            let Some(key) = CacheKey::from_hex(&hex) else {
                tracing::warn!(key = %hex, "Skipping unparsable cache key");
                continue;
            };

            let mut entry = self.entry(key);
            let size = entry
                .path()
                .and_then(|path| path.metadata().ok())
                .map_or(0, |metadata| metadata.len());

            if force || entry.expired(false)? {
                tracing::debug!(key = %hex, "Expunging cache entry");
                if !dry_run {
                    entry.expunge()?;
                }
                stats.expunged_files += 1;
                stats.expunged_bytes += size;
            } else {
                stats.retained_files += 1;
                stats.retained_bytes += size;
            }
        }

        tracing::info!(
            "Retained {} files, totaling {} bytes",
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} files, totaling {} bytes",
            stats.expunged_files,
            stats.expunged_bytes,
        );

        metric!(gauge("caches.size.files") = stats.retained_files as u64);
        metric!(gauge("caches.size.bytes") = stats.retained_bytes);
        metric!(counter("caches.files_removed") += stats.expunged_files as i64);

        Ok(stats)
    }
}
