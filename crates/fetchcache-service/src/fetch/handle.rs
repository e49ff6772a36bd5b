use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::{broadcast, oneshot};

use crate::caching::{CacheContents, CacheEntry, CacheError};
use crate::download::Progress;

/// How many progress updates are buffered per download. Slow subscribers
/// skip intermediate updates rather than stalling the transfer.
const PROGRESS_BUFFER: usize = 64;

/// What a download eventually settles to.
pub type FetchResult = CacheContents<Arc<CacheEntry>>;

type ResultChannel = Shared<oneshot::Receiver<FetchResult>>;

/// A handle to a (possibly shared) download.
///
/// The handle settles exactly once, to either the finished cache entry or the
/// error that ended the download. Every clone observes the same settlement,
/// which is how concurrent requests for one resource join a single transfer.
/// Await the handle (or call [`wait`](Self::wait)) for the result, and
/// subscribe to [`progress`](Self::progress) to watch the transfer without
/// polling.
pub struct FetchHandle {
    result: ResultChannel,
    progress: broadcast::Receiver<Progress>,
}

impl Clone for FetchHandle {
    fn clone(&self) -> Self {
        Self {
            result: self.result.clone(),
            progress: self.progress.resubscribe(),
        }
    }
}

impl fmt::Debug for FetchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchHandle")
            .field("settled", &self.result.peek().is_some())
            .finish()
    }
}

impl FetchHandle {
    /// Creates an unsettled handle together with its settling half.
    pub(crate) fn channel() -> (FetchSettler, FetchHandle) {
        let (result_tx, result_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = broadcast::channel(PROGRESS_BUFFER);

        let settler = FetchSettler {
            sender: result_tx,
            progress: progress_tx,
        };
        let handle = FetchHandle {
            result: result_rx.shared(),
            progress: progress_rx,
        };

        (settler, handle)
    }

    /// A handle that is already fulfilled with `entry`.
    pub fn resolved(entry: CacheEntry) -> Self {
        Self::settled(Ok(Arc::new(entry)))
    }

    /// A handle that is already rejected with `error`.
    pub fn rejected(error: CacheError) -> Self {
        Self::settled(Err(error))
    }

    fn settled(result: FetchResult) -> Self {
        let (settler, handle) = Self::channel();
        settler.settle(result);
        handle
    }

    /// Subscribes to transfer progress.
    ///
    /// The subscription only sees updates emitted after this call and ends
    /// (receives `Closed`) once the download settles.
    pub fn progress(&self) -> broadcast::Receiver<Progress> {
        self.progress.resubscribe()
    }

    /// Waits for the download to settle.
    pub async fn wait(&self) -> FetchResult {
        self.result.clone().await.unwrap_or_else(|_| {
            // The download task died without settling.
            tracing::error!("download channel dropped before settling");
            Err(CacheError::InternalError)
        })
    }
}

impl IntoFuture for FetchHandle {
    type Output = FetchResult;
    type IntoFuture = BoxFuture<'static, FetchResult>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.wait().await }.boxed()
    }
}

/// The settling half of a [`FetchHandle`].
///
/// Consumed by [`settle`](Self::settle), so settlement happens at most once
/// by construction. Dropping the settler without settling closes the progress
/// channel and surfaces as an internal error to waiters.
pub(crate) struct FetchSettler {
    sender: oneshot::Sender<FetchResult>,
    progress: broadcast::Sender<Progress>,
}

impl FetchSettler {
    /// Broadcasts a progress update to all current subscribers.
    pub fn notify(&self, progress: Progress) {
        let _ = self.progress.send(progress);
    }

    /// Settles the handle with `result`.
    pub fn settle(self, result: FetchResult) {
        let _ = self.sender.send(result);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use url::Url;

    use crate::caching::{CacheKey, CacheStore};
    use crate::config::Config;
    use crate::download::Progress;

    use super::*;

    fn entry(name: &str) -> CacheEntry {
        // No cache_dir: entries are memory-only, which is all these tests need.
        let store = Arc::new(CacheStore::from_config(&Config::default()).unwrap());
        let url = Url::parse(&format!("https://example.com/{name}")).unwrap();
        store.entry(CacheKey::from_url(&url))
    }

    #[tokio::test]
    async fn test_resolved_handle() {
        let handle = FetchHandle::resolved(entry("a"));
        let result = handle.wait().await.unwrap();
        assert_eq!(result.key().source(), Some("https://example.com/a"));
    }

    #[tokio::test]
    async fn test_rejected_handle() {
        let handle = FetchHandle::rejected(CacheError::Offline);
        assert_eq!(handle.wait().await.unwrap_err(), CacheError::Offline);
    }

    #[tokio::test]
    async fn test_clones_share_the_settlement() {
        let (settler, handle) = FetchHandle::channel();
        let joined = handle.clone();

        settler.settle(Ok(Arc::new(entry("b"))));

        let first = handle.wait().await.unwrap();
        let second = joined.wait().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_progress_reaches_all_subscribers() {
        let (settler, handle) = FetchHandle::channel();
        let mut first = handle.progress();
        let mut second = handle.clone().progress();

        let update = Progress {
            bytes_transferred: 42,
            total_bytes: Some(100),
        };
        settler.notify(update);

        assert_eq!(first.recv().await.unwrap(), update);
        assert_eq!(second.recv().await.unwrap(), update);
    }

    #[tokio::test]
    async fn test_progress_closes_on_settlement() {
        let (settler, handle) = FetchHandle::channel();
        let mut progress = handle.progress();

        settler.settle(Err(CacheError::NotFound));

        assert!(matches!(
            progress.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_dropped_settler_is_an_internal_error() {
        let (settler, handle) = FetchHandle::channel();
        drop(settler);

        assert_eq!(handle.await.unwrap_err(), CacheError::InternalError);
    }
}
