use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use fetchcache_test as test;

use crate::caching::{CacheError, CacheKey};
use crate::config::Config;

use super::*;

fn config(cache_dir: &Path) -> Config {
    Config {
        cache_dir: Some(cache_dir.to_path_buf()),
        download_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn service(config: &Config) -> FetchService {
    FetchService::new(config).unwrap()
}

async fn drain_progress(
    receiver: &mut tokio::sync::broadcast::Receiver<crate::download::Progress>,
) -> Vec<crate::download::Progress> {
    let mut updates = Vec::new();
    loop {
        match receiver.recv().await {
            Ok(update) => updates.push(update),
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
    }
    updates
}

#[tokio::test]
async fn test_download_fetches_and_caches() {
    test::setup();
    let cache_dir = test::tempdir();
    let server = test::Server::new();
    let service = service(&config(cache_dir.path()));

    let entry = service
        .download(server.url("files/foo.txt"))
        .await
        .unwrap();
    assert!(entry.just_downloaded());
    assert!(entry.is_cached());
    let path = entry.path().unwrap();
    assert_eq!(fs::read(path).unwrap(), b"foo.txt");

    let entry = service
        .download(server.url("files/foo.txt"))
        .await
        .unwrap();
    assert!(!entry.just_downloaded());

    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_concurrent_downloads_are_deduplicated() {
    test::setup();
    let cache_dir = test::tempdir();
    let server = test::Server::new();
    let service = service(&config(cache_dir.path()));

    let url = server.url("files/shared");
    let first = service.download(url.clone());
    let second = service.download(url);

    let (first, second) = tokio::join!(first.wait(), second.wait());
    let (first, second) = (first.unwrap(), second.unwrap());

    assert!(first.fingerprint().is_some());
    assert_eq!(first.fingerprint(), second.fingerprint());
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_queue_serializes_downloads() {
    test::setup();
    let cache_dir = test::tempdir();
    let server = test::Server::new();
    let config = Config {
        max_concurrent_downloads: 1,
        ..config(cache_dir.path())
    };
    let service = service(&config);

    let started = Instant::now();
    let slow = service.download(server.url("delay/200ms/files/x"));
    let fast = service.download(server.url("files/y"));

    let (slow, fast) = tokio::join!(slow.wait(), fast.wait());
    slow.unwrap();
    fast.unwrap();

    // With a single slot, the second download may not even reach the server
    // before the first one has completed.
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(
        server.all_hits(),
        vec!["/delay/200ms/files/x".to_string(), "/files/y".to_string()]
    );
}

#[tokio::test]
async fn test_failed_download_does_not_block_the_key() {
    test::setup();
    let cache_dir = test::tempdir();
    let server = test::Server::new();
    let service = service(&config(cache_dir.path()));

    let url = server.url("respond_statuscode/500/files/z");

    let error = service.download(url.clone()).await.unwrap_err();
    assert!(matches!(error, CacheError::Download(_)));

    // The pending entry was cleaned up, so the next request goes out again.
    let error = service.download(url).await.unwrap_err();
    assert!(matches!(error, CacheError::Download(_)));

    assert_eq!(server.accesses(), 2);
}

#[tokio::test]
async fn test_client_errors_are_not_found() {
    test::setup();
    let cache_dir = test::tempdir();
    let server = test::Server::new();
    let service = service(&config(cache_dir.path()));

    let error = service
        .download(server.url("respond_statuscode/404/files/missing"))
        .await
        .unwrap_err();
    assert_eq!(error, CacheError::NotFound);
}

#[tokio::test]
async fn test_offline_rejects_immediately() {
    test::setup();
    let cache_dir = test::tempdir();
    let server = test::Server::new();
    let service = service(&config(cache_dir.path()));

    service.downloader().set_online(false);

    let error = service.download(server.url("files/off")).await.unwrap_err();
    assert_eq!(error, CacheError::Offline);

    assert_eq!(server.accesses(), 0);
    assert_eq!(service.queue().running(), 0);
    assert_eq!(service.queue().waiting(), 0);
}

#[tokio::test]
async fn test_offline_still_serves_fresh_cache() {
    test::setup();
    let cache_dir = test::tempdir();
    let server = test::Server::new();
    let service = service(&config(cache_dir.path()));

    service.download(server.url("files/kept")).await.unwrap();
    service.downloader().set_online(false);

    let entry = service.download(server.url("files/kept")).await.unwrap();
    assert!(!entry.just_downloaded());
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_expired_entry_is_downloaded_again() {
    test::setup();
    let cache_dir = test::tempdir();
    let server = test::Server::new();
    let config = Config {
        retain_for: Duration::from_millis(300),
        ..config(cache_dir.path())
    };
    let service = service(&config);

    let url = server.url("files/ttl");
    service.download(url.clone()).await.unwrap();

    // Still fresh: served from cache.
    let entry = service.download(url.clone()).await.unwrap();
    assert!(!entry.just_downloaded());

    tokio::time::sleep(Duration::from_millis(400)).await;

    let entry = service.download(url).await.unwrap();
    assert!(entry.just_downloaded());
    assert_eq!(server.accesses(), 2);
}

#[tokio::test]
async fn test_expunged_entry_is_downloaded_again() {
    test::setup();
    let cache_dir = test::tempdir();
    let server = test::Server::new();
    let service = service(&config(cache_dir.path()));

    let url = server.url("files/gone");
    service.download(url.clone()).await.unwrap();

    let mut entry = service.store().entry(CacheKey::from_url(&url));
    entry.expunge().unwrap();

    let entry = service.download(url).await.unwrap();
    assert!(entry.just_downloaded());
    assert_eq!(server.accesses(), 2);
}

#[tokio::test]
async fn test_progress_reaches_every_joined_caller() {
    test::setup();
    let cache_dir = test::tempdir();
    let server = test::Server::new();
    let service = service(&config(cache_dir.path()));

    let url = server.url("payload/64/files/big");
    let first = service.download(url.clone());
    let mut first_progress = first.progress();
    let second = service.download(url);
    let mut second_progress = second.progress();

    let (first, second) = tokio::join!(first.wait(), second.wait());
    first.unwrap();
    second.unwrap();

    let first_updates = drain_progress(&mut first_progress).await;
    let second_updates = drain_progress(&mut second_progress).await;

    assert!(!first_updates.is_empty());
    assert!(!second_updates.is_empty());
    assert_eq!(first_updates.last().unwrap().bytes_transferred, 64 * 1024);
    assert_eq!(second_updates.last().unwrap().bytes_transferred, 64 * 1024);
}

#[tokio::test]
async fn test_download_timeout() {
    test::setup();
    let cache_dir = test::tempdir();
    let server = test::Server::new();
    let config = Config {
        download_timeout: Duration::from_millis(100),
        ..config(cache_dir.path())
    };
    let service = service(&config);

    let error = service
        .download(server.url("delay/300ms/files/slow"))
        .await
        .unwrap_err();
    assert_eq!(error, CacheError::Timeout(Duration::from_millis(100)));
}

#[tokio::test]
async fn test_load_and_data_callbacks() {
    test::setup();
    let cache_dir = test::tempdir();
    let server = test::Server::new();
    let service = service(&config(cache_dir.path()));

    let (sender, receiver) = tokio::sync::oneshot::channel();
    let data_updates = Arc::new(AtomicUsize::new(0));
    let counter = data_updates.clone();

    let options = DownloadOptions::new(server.url("payload/8/files/cb"))
        .on_data(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .on_load(move |entry| {
            sender.send(entry.fingerprint().map(str::to_owned)).ok();
        });
    service.download(options);

    let fingerprint = tokio::time::timeout(Duration::from_secs(5), receiver)
        .await
        .unwrap()
        .unwrap();
    assert!(fingerprint.is_some());

    tokio::time::timeout(Duration::from_secs(5), async {
        while data_updates.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_error_callback() {
    test::setup();
    let cache_dir = test::tempdir();
    let server = test::Server::new();
    let service = service(&config(cache_dir.path()));

    let (sender, receiver) = tokio::sync::oneshot::channel();
    let options = DownloadOptions::new(server.url("respond_statuscode/500/files/cbe"))
        .on_error(move |error| {
            sender.send(error).ok();
        });
    service.download(options);

    let error = tokio::time::timeout(Duration::from_secs(5), receiver)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(error, CacheError::Download(_)));
}
