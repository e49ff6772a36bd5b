//! Support for downloading from HTTP sources.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::{Client, StatusCode, header};
use url::Url;

use crate::caching::{CacheContents, CacheError};

use super::{Progress, USER_AGENT};

/// Downloader implementation for plain HTTP(S) sources.
#[derive(Debug)]
pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Downloads a resource, streaming the body chunk by chunk.
    ///
    /// `on_progress` is invoked once per received chunk with the running
    /// byte count.
    pub async fn download(
        &self,
        url: &Url,
        on_progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> CacheContents<Bytes> {
        tracing::debug!("Fetching resource from `{}`", url);

        let response = self
            .client
            .get(url.clone())
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(error_for_status(url, status));
        }

        let total_bytes = response.content_length();
        let mut body = BytesMut::new();

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await.transpose()? {
            body.extend_from_slice(&chunk);
            on_progress(Progress {
                bytes_transferred: body.len() as u64,
                total_bytes,
            });
        }

        Ok(body.freeze())
    }
}

fn error_for_status(url: &Url, status: StatusCode) -> CacheError {
    if matches!(status, StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED) {
        tracing::debug!("Insufficient permissions to download `{url}`: {status}");

        CacheError::PermissionDenied(status.to_string())
    } else if status.is_client_error() {
        // If it's a client error, chances are it's a 404.
        tracing::debug!("Unexpected client error status code from `{url}`: {status}");

        CacheError::NotFound
    } else {
        tracing::debug!("Unexpected status code from `{url}`: {status}");

        CacheError::Download(status.to_string())
    }
}
