//! The HTTP transport that fills the cache.
//!
//! [`DownloadService`] is intentionally dumb: it issues one GET per call,
//! enforces the configured timeout, and reports transfer progress. It knows
//! nothing about caching, deduplication, or concurrency limits; those live in
//! [`crate::fetch`]. Failed downloads are never retried here; retrying is a
//! caller decision.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use url::Url;

use crate::caching::{CacheContents, CacheError};
use crate::config::Config;

mod http;

pub const USER_AGENT: &str = concat!("fetchcache/", env!("CARGO_PKG_VERSION"));

/// A point-in-time snapshot of a running transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes received so far.
    pub bytes_transferred: u64,
    /// Total size of the resource, when the server reports one.
    pub total_bytes: Option<u64>,
}

/// A service which can download files over HTTP.
#[derive(Debug)]
pub struct DownloadService {
    http: http::HttpDownloader,
    timeout: Duration,
    online: AtomicBool,
}

impl DownloadService {
    pub fn new(config: &Config) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .unwrap();

        Arc::new(Self {
            http: http::HttpDownloader::new(client),
            timeout: config.download_timeout,
            online: AtomicBool::new(true),
        })
    }

    /// The connectivity signal consulted before any download is dispatched.
    ///
    /// This is an input, not a probe: hosts with their own connectivity
    /// detection flip it via [`set_online`](Self::set_online). It defaults to
    /// online.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    /// Downloads `url`, reporting each received chunk through `on_progress`.
    ///
    /// This does not do any deduplication; every call is a fresh download.
    /// The configured timeout bounds the whole transfer, including connection
    /// establishment.
    pub async fn download(
        &self,
        url: &Url,
        on_progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> CacheContents<Bytes> {
        let job = self.http.download(url, on_progress);
        let result = match tokio::time::timeout(self.timeout, job).await {
            Err(_) => Err(CacheError::Timeout(self.timeout)),
            Ok(result) => result,
        };

        match &result {
            Ok(bytes) => tracing::debug!("Resource `{}` fetched successfully ({} bytes)", url, bytes.len()),
            Err(err) => tracing::debug!("Resource `{}` fetching failed: {}", url, err),
        }

        result
    }
}
