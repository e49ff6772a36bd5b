use std::io;
use std::time::Duration;

use thiserror::Error;

/// An error that happens when fetching a resource or storing it in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The resource was not found at the remote source.
    #[error("not found")]
    NotFound,
    /// The resource could not be fetched due to missing permissions.
    ///
    /// The attached string contains the remote source's response status.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The resource could not be fetched within the configured timeout.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The resource could not be fetched due to another problem, like
    /// connection loss, DNS resolution, or a 5xx server response.
    ///
    /// The attached string contains the underlying error message.
    #[error("download failed: {0}")]
    Download(String),
    /// There is no connectivity and no usable cache entry for the resource.
    #[error("offline and not cached")]
    Offline,
    /// The downloaded artifact could not be verified on disk.
    ///
    /// The existence probe after the write decides this, independently of the
    /// write call's own result.
    #[error("cache write could not be verified: {0}")]
    WriteFailed(String),
    /// An unexpected error in the cache itself.
    #[error("internal error")]
    InternalError,
}

impl From<io::Error> for CacheError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for CacheError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(error: reqwest::Error) -> Self {
        Self::download_error(&error)
    }
}

impl CacheError {
    /// Creates a [`Download`](Self::Download) error from the innermost source
    /// of an error chain, which tends to carry the actually useful message.
    pub(crate) fn download_error(mut error: &dyn std::error::Error) -> Self {
        while let Some(source) = error.source() {
            error = source;
        }

        Self::Download(error.to_string())
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

/// The result of a cache operation, containing either `Ok(T)` or the reason
/// why the resource could not be fetched or stored.
pub type CacheContents<T = ()> = Result<T, CacheError>;
