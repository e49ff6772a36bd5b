use std::fmt;
use std::sync::Arc;

use url::Url;

use crate::caching::{CacheEntry, CacheError};
use crate::download::Progress;

/// Invoked once with the finished entry.
pub type LoadCallback = Box<dyn FnOnce(Arc<CacheEntry>) + Send + 'static>;
/// Invoked once with the error that ended the download.
pub type ErrorCallback = Box<dyn FnOnce(CacheError) + Send + 'static>;
/// Invoked for every observed progress update.
pub type DataCallback = Box<dyn Fn(Progress) + Send + 'static>;

/// The options form of a download request.
///
/// The callbacks are sugar layered over the returned
/// [`FetchHandle`](super::FetchHandle): they are driven by a watcher task
/// subscribed to the same handle every other caller gets.
pub struct DownloadOptions {
    pub url: Url,
    pub on_load: Option<LoadCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_data: Option<DataCallback>,
}

impl DownloadOptions {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            on_load: None,
            on_error: None,
            on_data: None,
        }
    }

    pub fn on_load(mut self, f: impl FnOnce(Arc<CacheEntry>) + Send + 'static) -> Self {
        self.on_load = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(CacheError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_data(mut self, f: impl Fn(Progress) + Send + 'static) -> Self {
        self.on_data = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("url", &self.url.as_str())
            .field("on_load", &self.on_load.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_data", &self.on_data.is_some())
            .finish()
    }
}

/// A download request: either a bare URL or an options record.
pub enum DownloadRequest {
    Url(Url),
    Options(DownloadOptions),
}

impl DownloadRequest {
    pub(crate) fn into_parts(self) -> (Url, Callbacks) {
        match self {
            Self::Url(url) => (url, Callbacks::default()),
            Self::Options(options) => (
                options.url,
                Callbacks {
                    on_load: options.on_load,
                    on_error: options.on_error,
                    on_data: options.on_data,
                },
            ),
        }
    }
}

impl From<Url> for DownloadRequest {
    fn from(url: Url) -> Self {
        Self::Url(url)
    }
}

impl From<DownloadOptions> for DownloadRequest {
    fn from(options: DownloadOptions) -> Self {
        Self::Options(options)
    }
}

impl fmt::Debug for DownloadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Self::Options(options) => f.debug_tuple("Options").field(options).finish(),
        }
    }
}

#[derive(Default)]
pub(crate) struct Callbacks {
    pub on_load: Option<LoadCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_data: Option<DataCallback>,
}

impl Callbacks {
    pub fn is_empty(&self) -> bool {
        self.on_load.is_none() && self.on_error.is_none() && self.on_data.is_none()
    }
}
