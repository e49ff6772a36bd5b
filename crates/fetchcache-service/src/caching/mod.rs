//! # Caching infrastructure
//!
//! The download cache keeps two pieces of state per resource:
//!
//! - The artifact bytes, written to `<cache_dir>/<downloads_dir>/<key>` where
//!   `<key>` is the SHA-256 of the resource URL ([`CacheKey`]).
//! - A metadata record (`last_used_at` timestamp and content fingerprint) in
//!   the [`MetaDb`], a single JSON file persisted atomically on every change.
//!
//! A resource counts as cached only while both exist: the record is the source
//! of truth for freshness, and the artifact file is probed on every lookup so
//! a file deleted behind our back degrades to a cache miss instead of an
//! error.
//!
//! Entries expire a fixed duration after their last use
//! ([`Config::retain_for`](crate::config::Config)). Expired entries are not
//! removed eagerly: [`CacheStore::sweep`] walks the metadata records and
//! expunges everything stale (or everything, when forced). The sweep never
//! runs as a side effect of a download.
//!
//! [`CacheError`] is the error type for the whole download path. Most
//! variants describe a failed transfer; [`CacheError::WriteFailed`] means the
//! artifact could not be verified on disk after a successful transfer, and
//! [`CacheError::InternalError`] is the catch-all for unexpected conditions
//! such as filesystem failures, which are logged when they are converted.

use std::io;

mod cache_error;
mod cache_key;
mod cleanup;
mod entry;
mod meta_db;

pub use cache_error::{CacheContents, CacheError};
pub use cache_key::CacheKey;
pub use cleanup::{SweepStats, cleanup};
pub use entry::{CacheEntry, CacheStore};
pub use meta_db::{EntryRecord, MetaDb};

pub(crate) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
