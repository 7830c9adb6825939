use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use futures::FutureExt;
use tokio::sync::watch;
use tower::util::ServiceExt;
use vodstream::args::EncoderSettings;
use vodstream::catalog::{ContentKey, MediaCatalog, MediaEntry};
use vodstream::error::StreamError;
use vodstream::hls::HlsOptions;
use vodstream::probe::{MediaInfo, MediaProber};
use vodstream::process::{EncoderCommand, ExitFuture, ExitOutcome, Launcher};
use vodstream::segments::SegmentStore;
use vodstream::{create_app, AppState, SessionsView};

#[derive(Default)]
struct CountingLauncher {
    launches: AtomicUsize,
}

impl Launcher for CountingLauncher {
    fn launch(
        &self,
        _label: &str,
        _command: &EncoderCommand,
        mut stop: watch::Receiver<bool>,
    ) -> Result<ExitFuture, StreamError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(async move {
            loop {
                if *stop.borrow() {
                    break;
                }
                if stop.changed().await.is_err() {
                    break;
                }
            }
            ExitOutcome::Stopped
        }
        .boxed())
    }
}

struct FixedProber;

#[async_trait]
impl MediaProber for FixedProber {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, StreamError> {
        Ok(MediaInfo {
            path: path.to_path_buf(),
            duration: 7.5,
            width: 1280,
            height: 720,
            video_codec: Some("h264".into()),
            audio_codec: Some("aac".into()),
            format_name: Some("mov,mp4,m4a,3gp,3g2,mj2".into()),
        })
    }
}

struct TestApp {
    _cache: tempfile::TempDir,
    store: SegmentStore,
    launcher: Arc<CountingLauncher>,
    app: Router,
}

fn key() -> ContentKey {
    ContentKey::parse("movie").unwrap()
}

fn test_app() -> TestApp {
    let cache = tempfile::tempdir().unwrap();
    let store = SegmentStore::new(cache.path());
    let launcher = Arc::new(CountingLauncher::default());
    let catalog = MediaCatalog::from_entries(vec![MediaEntry {
        key: key(),
        name: "Movie.mp4".into(),
        path: PathBuf::from("/media/Movie.mp4"),
    }]);
    let state = AppState::new(
        catalog,
        store.clone(),
        EncoderSettings::default(),
        HlsOptions {
            gap_threshold: 10,
            segment_wait: Duration::from_millis(200),
            poll_interval: Duration::from_millis(20),
        },
        launcher.clone(),
        Arc::new(FixedProber),
    );
    TestApp {
        _cache: cache,
        store,
        launcher,
        app: create_app(Arc::new(state)),
    }
}

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    http_body_util::BodyExt::collect(response.into_body())
        .await
        .unwrap()
        .to_bytes()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn write_segment(store: &SegmentStore, index: usize, contents: &[u8]) {
    let path = store.segment_path(&key(), index);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

#[tokio::test]
async fn test_media_api() {
    let t = test_app();
    let response = t.app.oneshot(get("/api/media")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let entries: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(entries[0]["key"], "movie");
    assert_eq!(entries[0]["name"], "Movie.mp4");
    assert!(entries[0].get("path").is_none());
}

#[tokio::test]
async fn test_playlist() {
    let t = test_app();
    let response = t.app.oneshot(get("/movie/hls/playlist.m3u8")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/vnd.apple.mpegurl"
    );

    let text = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
    assert!(text.starts_with("#EXTM3U\n"));
    assert_eq!(text.matches("#EXTINF:").count(), 4);
    assert!(text.contains("#EXTINF:1.500000,\n3.ts\n#EXT-X-ENDLIST"));
    assert_eq!(t.launcher.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_and_malformed_keys() {
    let t = test_app();
    let response = t.app.clone().oneshot(get("/nosuchkey/hls/playlist.m3u8")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = t.app.oneshot(get("/bad.key/hls/0.ts")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cached_segment_with_ranges() {
    let t = test_app();
    write_segment(&t.store, 2, b"0123456789");

    let response = t.app.clone().oneshot(get("/movie/hls/2.ts")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp2t");
    assert_eq!(body_bytes(response).await.as_ref(), b"0123456789");

    let request = Request::builder()
        .uri("/movie/hls/2.ts")
        .header(header::RANGE, "bytes=2-5")
        .body(Body::empty())
        .unwrap();
    let response = t.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 2-5/10");
    assert_eq!(body_bytes(response).await.as_ref(), b"2345");

    let request = Request::builder()
        .method("HEAD")
        .uri("/movie/hls/2.ts")
        .body(Body::empty())
        .unwrap();
    let response = t.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "10");

    assert_eq!(t.launcher.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_segment_names() {
    let t = test_app();
    for uri in ["/movie/hls/abc.ts", "/movie/hls/1.ts.tmp", "/movie/hls/-1.ts"] {
        let response = t.app.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
    }
}

#[tokio::test]
async fn test_segment_past_end() {
    let t = test_app();
    let response = t.app.oneshot(get("/movie/hls/4.ts")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_segment_timeout_keeps_session() {
    let t = test_app();
    let response = t.app.clone().oneshot(get("/movie/hls/1.ts")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    assert_eq!(t.launcher.launches.load(Ordering::SeqCst), 1);

    let response = t.app.oneshot(get("/api/sessions")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let view: SessionsView = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(view.sessions.len(), 1);
    assert_eq!(view.sessions[0].key, "movie");
    assert_eq!(view.sessions[0].start_segment, 1);
    assert_eq!(view.direct_streams, 0);
}

#[tokio::test]
async fn test_stream_rejects_bad_parameters() {
    let t = test_app();
    for uri in [
        "/movie/stream.avi",
        "/movie/stream.webm?codec=hevc",
        "/movie/stream.mp4?resolution=8k",
        "/movie/stream.mp4?start=soon",
    ] {
        let response = t.app.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
    }

    let response = t.app.oneshot(get("/movie/poster.jpg")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics() {
    let t = test_app();
    // Touch a counter so the registry is populated.
    let _ = t.app.clone().oneshot(get("/movie/hls/0.ts")).await.unwrap();

    let response = t.app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
    assert!(text.contains("vodstream_session_starts_total"));
}
