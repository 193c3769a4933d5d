use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{Notify, broadcast};
use transfer_engine::{
    DownloadEvent, DownloadOptions, DownloadOutcome, DownloadStatus, RangeDownloader, TransferError,
};

const PIECE: usize = 4096;

struct Upstream {
    payload: Vec<u8>,
    ranges: Mutex<Vec<Option<String>>>,
    requests: AtomicUsize,
    /// Holds `/gated.flv` responses until notified.
    release: Notify,
}

impl Upstream {
    fn record(&self, headers: &HeaderMap) -> u64 {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let range = headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let offset = range
            .as_deref()
            .and_then(|r| r.strip_prefix("bytes="))
            .and_then(|r| r.trim_end_matches('-').parse().ok())
            .unwrap_or(0);
        self.ranges.lock().push(range);
        offset
    }

    fn last_range(&self) -> Option<String> {
        self.ranges.lock().last().cloned().flatten()
    }
}

fn partial_headers(offset: u64, total: usize) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CONTENT_RANGE,
        HeaderValue::from_str(&format!("bytes {offset}-{}/{total}", total - 1)).unwrap(),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&(total as u64 - offset).to_string()).unwrap(),
    );
    headers
}

async fn ranged(State(up): State<Arc<Upstream>>, headers: HeaderMap) -> Response {
    let offset = up.record(&headers);
    let body = up.payload[offset as usize..].to_vec();
    (StatusCode::PARTIAL_CONTENT, partial_headers(offset, up.payload.len()), body).into_response()
}

/// Range-aware, but trickles the body out piece by piece.
async fn slow(State(up): State<Arc<Upstream>>, headers: HeaderMap) -> Response {
    let offset = up.record(&headers);
    let rest = Bytes::from(up.payload[offset as usize..].to_vec());
    let body = stream::unfold(rest, |rest| async move {
        if rest.is_empty() {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut rest = rest;
        let piece = rest.split_to(PIECE.min(rest.len()));
        Some((Ok::<_, std::io::Error>(piece), rest))
    });
    (
        StatusCode::PARTIAL_CONTENT,
        partial_headers(offset, up.payload.len()),
        Body::from_stream(body),
    )
        .into_response()
}

/// Sends one piece, then goes silent without closing.
async fn stall(State(up): State<Arc<Upstream>>, headers: HeaderMap) -> Response {
    let offset = up.record(&headers);
    let first = Bytes::from(up.payload[offset as usize..offset as usize + 16].to_vec());
    let body = stream::iter([Ok::<_, std::io::Error>(first)]).chain(stream::pending());
    (
        StatusCode::PARTIAL_CONTENT,
        partial_headers(offset, up.payload.len()),
        Body::from_stream(body),
    )
        .into_response()
}

/// Ignores `Range`; the first response breaks off halfway through.
async fn no_range(State(up): State<Arc<Upstream>>, headers: HeaderMap) -> Response {
    let first = up.requests.load(Ordering::SeqCst) == 0;
    up.record(&headers);
    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&up.payload.len().to_string()).unwrap(),
    );
    if first {
        let half = Bytes::from(up.payload[..up.payload.len() / 2].to_vec());
        let body = stream::iter([
            Ok(half),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ]);
        return (StatusCode::OK, response_headers, Body::from_stream(body)).into_response();
    }
    (StatusCode::OK, response_headers, up.payload.clone()).into_response()
}

async fn gated(State(up): State<Arc<Upstream>>, headers: HeaderMap) -> Response {
    let offset = up.record(&headers);
    up.release.notified().await;
    let body = up.payload[offset as usize..].to_vec();
    (StatusCode::PARTIAL_CONTENT, partial_headers(offset, up.payload.len()), body).into_response()
}

async fn broken(State(up): State<Arc<Upstream>>, headers: HeaderMap) -> Response {
    up.record(&headers);
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

async fn spawn_upstream(len: usize) -> (String, Arc<Upstream>) {
    let upstream = Arc::new(Upstream {
        payload: (0..len).map(|i| (i * 7 % 256) as u8).collect(),
        ranges: Mutex::new(Vec::new()),
        requests: AtomicUsize::new(0),
        release: Notify::new(),
    });
    let app = Router::new()
        .route("/file.flv", get(ranged))
        .route("/slow.flv", get(slow))
        .route("/stall.flv", get(stall))
        .route("/no-range.flv", get(no_range))
        .route("/gated.flv", get(gated))
        .route("/broken.flv", get(broken))
        .with_state(upstream.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), upstream)
}

fn fast_options() -> DownloadOptions {
    DownloadOptions::default()
        .with_retry_delay(Duration::from_millis(10))
        .with_stall_timeout(Duration::from_secs(2))
}

async fn wait_for_progress(rx: &mut broadcast::Receiver<DownloadEvent>, at_least: u64) {
    loop {
        match rx.recv().await.unwrap() {
            DownloadEvent::Progress { loaded, .. } if loaded >= at_least => return,
            _ => {}
        }
    }
}

#[tokio::test]
async fn downloads_whole_file_with_progress() {
    let (base, upstream) = spawn_upstream(50_000).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.flv");

    let downloader =
        RangeDownloader::with_client(test_client(), format!("{base}/file.flv"), &path, fast_options())
            .unwrap();
    let mut rx = downloader.subscribe();

    let outcome = downloader.start().unwrap().wait().await.unwrap();
    assert_eq!(outcome, DownloadOutcome::Completed);
    assert_eq!(tokio::fs::read(&path).await.unwrap(), upstream.payload);
    assert_eq!(upstream.last_range().as_deref(), Some("bytes=0-"));

    let mut last_loaded = 0;
    let mut completed = None;
    while let Ok(event) = rx.try_recv() {
        match event {
            DownloadEvent::Progress { loaded, total, .. } => {
                assert!(loaded > last_loaded);
                assert_eq!(total, 50_000);
                last_loaded = loaded;
            }
            DownloadEvent::Completed(snapshot) => completed = Some(snapshot),
            DownloadEvent::Error { message } => panic!("unexpected error: {message}"),
        }
    }
    assert_eq!(last_loaded, 50_000);
    let snapshot = completed.expect("completion event");
    assert_eq!(snapshot.status, DownloadStatus::Completed);
    assert_eq!(snapshot.downloaded_size, 50_000);
    assert_eq!(snapshot.total_size, 50_000);
}

#[tokio::test]
async fn pause_then_resume_continues_from_offset() {
    let (base, upstream) = spawn_upstream(PIECE * 16).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.flv");

    let downloader =
        RangeDownloader::with_client(test_client(), format!("{base}/slow.flv"), &path, fast_options())
            .unwrap();
    let mut rx = downloader.subscribe();

    let handle = downloader.start().unwrap();
    wait_for_progress(&mut rx, (PIECE * 2) as u64).await;
    downloader.pause().unwrap();
    assert_eq!(handle.wait().await.unwrap(), DownloadOutcome::Paused);

    let paused = downloader.snapshot();
    assert_eq!(paused.status, DownloadStatus::Paused);
    assert!(paused.downloaded_size > 0);
    assert!(paused.downloaded_size < upstream.payload.len() as u64);

    let outcome = downloader.start().unwrap().wait().await.unwrap();
    assert_eq!(outcome, DownloadOutcome::Completed);
    assert_eq!(
        upstream.last_range(),
        Some(format!("bytes={}-", paused.downloaded_size))
    );
    assert_eq!(tokio::fs::read(&path).await.unwrap(), upstream.payload);
}

#[tokio::test]
async fn cancel_resets_and_next_start_begins_from_zero() {
    let (base, upstream) = spawn_upstream(PIECE * 16).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.flv");

    let downloader =
        RangeDownloader::with_client(test_client(), format!("{base}/slow.flv"), &path, fast_options())
            .unwrap();
    let mut rx = downloader.subscribe();

    let handle = downloader.start().unwrap();
    wait_for_progress(&mut rx, PIECE as u64).await;
    downloader.cancel().unwrap();
    assert_eq!(handle.wait().await.unwrap(), DownloadOutcome::Canceled);

    let canceled = downloader.snapshot();
    assert_eq!(canceled.status, DownloadStatus::Canceled);
    assert_eq!(canceled.downloaded_size, 0);
    assert_eq!(canceled.total_size, 0);

    let requests_before = upstream.requests.load(Ordering::SeqCst);
    let outcome = downloader.start().unwrap().wait().await.unwrap();
    assert_eq!(outcome, DownloadOutcome::Completed);
    assert_eq!(
        upstream.ranges.lock()[requests_before].as_deref(),
        Some("bytes=0-")
    );
    assert_eq!(tokio::fs::read(&path).await.unwrap(), upstream.payload);

    while let Ok(event) = rx.try_recv() {
        assert!(!matches!(event, DownloadEvent::Error { .. }));
    }
}

#[tokio::test]
async fn stalled_body_is_retried_then_fails() {
    let (base, upstream) = spawn_upstream(10_000).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.flv");

    let options = DownloadOptions::default()
        .with_max_retries(2)
        .with_retry_delay(Duration::from_millis(10))
        .with_stall_timeout(Duration::from_millis(200));
    let downloader =
        RangeDownloader::with_client(test_client(), format!("{base}/stall.flv"), &path, options)
            .unwrap();
    let mut rx = downloader.subscribe();

    let err = downloader.start().unwrap().wait().await.unwrap_err();
    assert!(matches!(err, TransferError::StallTimeout { retries: 2, .. }), "{err}");
    assert_eq!(upstream.requests.load(Ordering::SeqCst), 3);

    let snapshot = downloader.snapshot();
    assert_eq!(snapshot.status, DownloadStatus::Error);
    assert_eq!(snapshot.retry_count, 2);
    // Each retry resumes after the bytes that did arrive.
    let ranges = upstream.ranges.lock().clone();
    assert_eq!(ranges[0].as_deref(), Some("bytes=0-"));
    assert_eq!(ranges[1].as_deref(), Some("bytes=16-"));
    assert_eq!(ranges[2].as_deref(), Some("bytes=32-"));

    let mut saw_error = false;
    while let Ok(event) = rx.try_recv() {
        saw_error |= matches!(event, DownloadEvent::Error { .. });
    }
    assert!(saw_error);
    assert!(downloader.start().is_err());
}

#[tokio::test]
async fn ignored_range_restarts_from_zero() {
    let (base, upstream) = spawn_upstream(20_000).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.flv");

    let downloader = RangeDownloader::with_client(
        test_client(),
        format!("{base}/no-range.flv"),
        &path,
        fast_options(),
    )
    .unwrap();

    let outcome = downloader.start().unwrap().wait().await.unwrap();
    assert_eq!(outcome, DownloadOutcome::Completed);
    assert!(upstream.requests.load(Ordering::SeqCst) >= 2);
    assert_eq!(tokio::fs::read(&path).await.unwrap(), upstream.payload);
    assert_eq!(downloader.snapshot().downloaded_size, 20_000);
}

#[tokio::test]
async fn server_errors_exhaust_retries() {
    let (base, upstream) = spawn_upstream(100).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.flv");

    let options = fast_options().with_max_retries(1);
    let downloader =
        RangeDownloader::with_client(test_client(), format!("{base}/broken.flv"), &path, options)
            .unwrap();
    let mut rx = downloader.subscribe();

    let err = downloader.start().unwrap().wait().await.unwrap_err();
    assert!(
        matches!(
            err,
            TransferError::HttpStatus {
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                ..
            }
        ),
        "{err}"
    );
    assert_eq!(upstream.requests.load(Ordering::SeqCst), 2);
    assert_eq!(downloader.status(), DownloadStatus::Error);
    assert!(matches!(rx.try_recv(), Ok(DownloadEvent::Error { .. })));
}

#[tokio::test]
async fn fresh_start_discards_a_leftover_file() {
    let (base, upstream) = spawn_upstream(10_000).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.flv");
    tokio::fs::write(&path, vec![0xAA; 3_000]).await.unwrap();

    let downloader =
        RangeDownloader::with_client(test_client(), format!("{base}/file.flv"), &path, fast_options())
            .unwrap();
    let outcome = downloader.start().unwrap().wait().await.unwrap();

    assert_eq!(outcome, DownloadOutcome::Completed);
    assert_eq!(upstream.requests.load(Ordering::SeqCst), 1);
    assert_eq!(upstream.last_range().as_deref(), Some("bytes=0-"));
    assert_eq!(tokio::fs::read(&path).await.unwrap(), upstream.payload);
}

#[tokio::test]
async fn write_failure_is_reported_once_without_retry() {
    let (base, upstream) = spawn_upstream(10_000).await;
    let dir = tempfile::tempdir().unwrap();
    let target_dir = dir.path().join("recordings");
    let path = target_dir.join("out.flv");

    let downloader =
        RangeDownloader::with_client(test_client(), format!("{base}/gated.flv"), &path, fast_options())
            .unwrap();
    let mut rx = downloader.subscribe();
    let handle = downloader.start().unwrap();

    // Once the request is in flight, swap the destination directory for a
    // regular file so opening the output fails.
    while upstream.requests.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::fs::remove_dir_all(&target_dir).await.unwrap();
    tokio::fs::write(&target_dir, b"not a directory").await.unwrap();
    upstream.release.notify_one();

    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, TransferError::Io { .. }), "{err}");
    assert_eq!(downloader.status(), DownloadStatus::Error);
    assert_eq!(upstream.requests.load(Ordering::SeqCst), 1);
    assert_eq!(downloader.snapshot().retry_count, 0);
    assert!(matches!(rx.recv().await, Ok(DownloadEvent::Error { .. })));
}

/// reqwest is built without a bundled rustls provider; install one before
/// constructing a client.
fn test_client() -> reqwest::Client {
    transfer_engine::install_rustls_provider();
    reqwest::Client::new()
}
