//! A deduplicating, concurrency-bounded download cache.
//!
//! The service downloads remote resources over HTTP and keeps the resulting
//! artifacts on the local file system. Repeated requests for the same URL are
//! served from the cache until the entry goes stale, concurrent requests for
//! the same URL join a single in-flight download, and the total number of
//! concurrent downloads is bounded by a FIFO dispatch queue.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod download;
pub mod fetch;
pub mod utils;

pub use caching::{CacheContents, CacheEntry, CacheError, CacheKey, CacheStore, SweepStats};
pub use config::Config;
pub use download::{DownloadService, Progress};
pub use fetch::{DispatchQueue, DownloadOptions, DownloadRequest, FetchHandle, FetchService};
