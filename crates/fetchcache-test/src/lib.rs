//! Helpers for testing the download cache service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all
//!    console output is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory
//!    is held for the entire lifetime of the test. When dropped too early,
//!    this might silently leak the temp directory, since the service will
//!    create it again lazily after it has been deleted. To avoid this, assign
//!    it to a variable in the test function (e.g. `let _cache_dir =
//!    test::tempdir()`).
//!
//!  - When using [`Server`], make sure that the server is held until all
//!    requests to it have been made. If the server is dropped, the ports
//!    remain open and all connections to it will time out. To avoid this,
//!    assign it to a variable: `let server = test::Server::new();`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Request};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::routing::get;
use futures::StreamExt;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from this workspace's
///    crates and mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("fetchcache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it
/// as a guard to automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test web server bound to a random local port, recording every request.
///
/// Routes:
///
///  - `/files/*path` responds `200` with the path itself as the body.
///  - `/delay/:time/*path` sleeps for the given [`humantime`] duration, then
///    responds like `/files`.
///  - `/respond_statuscode/:num/*path` responds with the given status code
///    and an empty body.
///  - `/payload/:kb/*path` streams the given number of 1 KiB chunks with a
///    short pause between chunks.
///
/// This server requires a `tokio` runtime and is supposed to be run in a
/// `tokio::test`. It automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    hits: Arc<Mutex<Vec<String>>>,
}

impl Server {
    pub fn new() -> Self {
        let hits: Arc<Mutex<Vec<String>>> = Default::default();

        let recorder = {
            let hits = hits.clone();
            move |request: Request, next: Next| {
                let hits = hits.clone();
                async move {
                    hits.lock().unwrap().push(request.uri().path().to_string());
                    next.run(request).await
                }
            }
        };

        let router = Router::new()
            .route(
                "/files/*path",
                get(|Path(path): Path<String>| async move { path }),
            )
            .route(
                "/delay/:time/*path",
                get(|Path((time, path)): Path<(String, String)>| async move {
                    let duration = humantime::parse_duration(&time).unwrap();
                    tokio::time::sleep(duration).await;

                    path
                }),
            )
            .route(
                "/respond_statuscode/:num/*path",
                get(|Path((num, _)): Path<(u16, String)>| async move {
                    StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                }),
            )
            .route(
                "/payload/:kb/*path",
                get(|Path((kb, _)): Path<(u64, String)>| async move {
                    let chunks = futures::stream::iter(0..kb).then(|_| async {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        Ok::<_, Infallible>(Bytes::from(vec![b'x'; 1024]))
                    });

                    Body::from_stream(chunks)
                }),
            )
            .layer(middleware::from_fn(recorder));

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            handle,
            socket,
            hits,
        }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }

    /// The number of requests served so far. Resets the request log.
    pub fn accesses(&self) -> usize {
        std::mem::take(&mut *self.hits.lock().unwrap()).len()
    }

    /// The request paths served so far, in arrival order. Resets the request
    /// log.
    pub fn all_hits(&self) -> Vec<String> {
        std::mem::take(&mut *self.hits.lock().unwrap())
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
