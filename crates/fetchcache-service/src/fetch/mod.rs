//! The request-level state machine on top of cache and transport.
//!
//! [`FetchService::download`] decides, per resource, between four outcomes in
//! this order of precedence:
//!
//! 1. A download for the key is already in flight: return the same
//!    [`FetchHandle`], so any number of concurrent callers share one network
//!    operation and observe one settlement.
//! 2. The entry is cached and fresh: bump its last-use time and return an
//!    already-fulfilled handle. No network, no queue.
//! 3. The transport is offline: return an already-rejected handle.
//! 4. Otherwise, spawn a download: enqueue a dispatch-queue ticket, transfer,
//!    write the artifact, persist the metadata.
//!
//! The pending-request table is updated before a ticket is enqueued and
//! cleaned up unconditionally when the download settles, so a request
//! arriving during queueing or during the live transfer joins the same
//! handle, and a failed download never leaves its key blocked.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::error::RecvError;
use url::Url;

use crate::caching::{CacheEntry, CacheError, CacheKey, CacheStore, SweepStats};
use crate::config::Config;
use crate::download::DownloadService;
use crate::utils::defer::defer;

mod handle;
mod queue;
mod request;
#[cfg(test)]
mod tests;

pub use handle::{FetchHandle, FetchResult};
pub use queue::{DispatchQueue, SlotPermit};
pub use request::{DataCallback, DownloadOptions, DownloadRequest, ErrorCallback, LoadCallback};

use handle::FetchSettler;
use request::Callbacks;

type PendingMap = Arc<Mutex<BTreeMap<CacheKey, FetchHandle>>>;

/// Downloads remote resources into the local cache.
///
/// At most one network operation runs per resource at any time, and the total
/// number of concurrent downloads is bounded by the dispatch queue. The
/// service is cheap to clone; clones share all state.
#[derive(Debug, Clone)]
pub struct FetchService {
    store: Arc<CacheStore>,
    downloader: Arc<DownloadService>,
    queue: DispatchQueue,
    pending: PendingMap,
}

impl FetchService {
    pub fn new(config: &Config) -> io::Result<Self> {
        let store = Arc::new(CacheStore::from_config(config)?);
        let downloader = DownloadService::new(config);
        Ok(Self::with_parts(
            store,
            downloader,
            config.max_concurrent_downloads,
        ))
    }

    pub fn with_parts(
        store: Arc<CacheStore>,
        downloader: Arc<DownloadService>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            store,
            downloader,
            queue: DispatchQueue::new(max_concurrent),
            pending: Default::default(),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn downloader(&self) -> &Arc<DownloadService> {
        &self.downloader
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    /// Requests a resource from cache or network.
    ///
    /// NOTE: This is deliberately *not* an `async fn`: the outcome is decided
    /// and a new download is spawned eagerly, even if the returned handle is
    /// never awaited.
    pub fn download(&self, request: impl Into<DownloadRequest>) -> FetchHandle {
        let (url, callbacks) = request.into().into_parts();

        let handle = self.lookup_or_spawn(url);
        if !callbacks.is_empty() {
            Self::install_callbacks(&handle, callbacks);
        }

        handle
    }

    fn lookup_or_spawn(&self, url: Url) -> FetchHandle {
        let key = CacheKey::from_url(&url);
        metric!(counter("downloads.requests") += 1);

        // The lock spans lookup through insertion: a concurrent caller for
        // the same key either joins the handle installed below, or arrives
        // after settlement and sees the entry this download wrote.
        let mut pending = self.pending.lock().unwrap();

        if let Some(handle) = pending.get(&key) {
            metric!(counter("downloads.joined") += 1);
            tracing::debug!(key = %key, "Joining in-flight download");
            return handle.clone();
        }

        let mut entry = self.store.entry(key.clone());
        if entry.is_cached() {
            match entry.expired(false) {
                Ok(false) => {
                    if let Err(err) = entry.touch() {
                        return FetchHandle::rejected(err);
                    }
                    metric!(counter("downloads.cache_hit") += 1);
                    tracing::debug!(key = %key, "Serving cached resource");
                    return FetchHandle::resolved(entry);
                }
                Ok(true) => {}
                Err(err) => return FetchHandle::rejected(err),
            }
        }

        if !self.downloader.is_online() {
            metric!(counter("downloads.offline") += 1);
            tracing::debug!(key = %key, "Rejecting download, transport is offline");
            return FetchHandle::rejected(CacheError::Offline);
        }

        let (settler, handle) = FetchHandle::channel();
        entry.set_pending(true);
        pending.insert(key.clone(), handle.clone());
        drop(pending);

        // Enqueue the admission ticket while still in the caller's turn, so
        // downloads are admitted in request order, not task-wakeup order.
        let ticket = self.queue.acquire();

        let this = self.clone();
        tokio::spawn(async move {
            // Remove the pending entry *before* settling, so that late
            // callers either join a channel that will still deliver, or
            // start a fresh download.
            let pending = Arc::clone(&this.pending);
            let cleanup_key = key.clone();
            let unregister = defer(move || {
                pending.lock().unwrap().remove(&cleanup_key);
            });

            let result = this.fetch(&url, entry, ticket, &settler).await;
            if let Err(err) = &result {
                metric!(counter("downloads.failures") += 1);
                tracing::debug!(
                    key = %key,
                    source = key.source().unwrap_or(""),
                    error = %err,
                    "Download failed",
                );
            }

            drop(unregister);
            settler.settle(result);
        });

        handle
    }

    /// Runs one download end to end, once it is admitted.
    async fn fetch(
        &self,
        url: &Url,
        mut entry: CacheEntry,
        ticket: impl Future<Output = SlotPermit>,
        settler: &FetchSettler,
    ) -> FetchResult {
        let _slot = ticket.await;
        metric!(gauge("downloads.running") = self.queue.running() as u64);

        let bytes = self
            .downloader
            .download(url, &|progress| settler.notify(progress))
            .await?;
        metric!(time_raw("downloads.size") = bytes.len() as u64);

        entry.write(&bytes)?;
        entry.set_pending(false);
        entry.mark_just_downloaded();
        entry.touch()?;

        Ok(Arc::new(entry))
    }

    /// Drives the callback sugar of [`DownloadOptions`] from the handle.
    fn install_callbacks(handle: &FetchHandle, callbacks: Callbacks) {
        let Callbacks {
            on_load,
            on_error,
            on_data,
        } = callbacks;

        if let Some(on_data) = on_data {
            let mut progress = handle.progress();
            tokio::spawn(async move {
                loop {
                    match progress.recv().await {
                        Ok(update) => on_data(update),
                        Err(RecvError::Lagged(_)) => continue,
                        Err(RecvError::Closed) => break,
                    }
                }
            });
        }

        if on_load.is_some() || on_error.is_some() {
            let handle = handle.clone();
            tokio::spawn(async move {
                match handle.wait().await {
                    Ok(entry) => {
                        if let Some(on_load) = on_load {
                            on_load(entry);
                        }
                    }
                    Err(err) => {
                        if let Some(on_error) = on_error {
                            on_error(err);
                        }
                    }
                }
            });
        }
    }

    /// Expunges expired (or, with `force`, all) cache entries.
    pub fn sweep(&self, force: bool) -> anyhow::Result<SweepStats> {
        self.store.sweep(force, false)
    }
}
