pub mod args;
pub mod catalog;
pub mod config;
pub mod error;
pub mod hardware;
pub mod hls;
pub mod metrics;
pub mod playlist;
pub mod probe;
pub mod process;
pub mod segments;
pub mod stream;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;
use std::time::SystemTime;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::args::{Codec, EncoderSettings, StreamingResolution};
use crate::catalog::{MediaCatalog, MediaEntry};
use crate::error::StreamError;
use crate::hls::{HlsOptions, HlsOrchestrator};
use crate::probe::MediaProber;
use crate::process::Launcher;
use crate::segments::{parse_segment_name, SegmentStore};
use crate::stream::{DirectStreamer, StreamRequest};
use crate::supervisor::Supervisor;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";
/// Segment URIs are relative to the playlist.
const SEGMENT_URL_TEMPLATE: &str = "%d.ts";

pub struct AppState {
    catalog: MediaCatalog,
    hls: HlsOrchestrator,
    streamer: DirectStreamer,
    prober: Arc<dyn MediaProber>,
    default_resolution: StreamingResolution,
}

impl AppState {
    /// Wires the engine together. Spawns the supervisor's exit loop, so call
    /// from within a tokio runtime.
    pub fn new(
        catalog: MediaCatalog,
        store: SegmentStore,
        encoder: EncoderSettings,
        options: HlsOptions,
        launcher: Arc<dyn Launcher>,
        prober: Arc<dyn MediaProber>,
    ) -> Self {
        let default_resolution = encoder.max_transcode_size;
        let streamer = DirectStreamer::new(encoder.clone());
        let supervisor = Supervisor::new(launcher, store.clone(), encoder);
        let hls = HlsOrchestrator::new(supervisor, store, prober.clone(), options);
        Self {
            catalog,
            hls,
            streamer,
            prober,
            default_resolution,
        }
    }

    pub fn hls(&self) -> &HlsOrchestrator {
        &self.hls
    }

    pub fn catalog(&self) -> &MediaCatalog {
        &self.catalog
    }
}

pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/media", get(media_api_handler))
        .route("/api/sessions", get(sessions_api_handler))
        .route("/metrics", get(metrics_handler))
        .route(
            "/{key}/hls/playlist.m3u8",
            get(hls_playlist_handler).head(hls_playlist_handler),
        )
        .route(
            "/{key}/hls/{segment}",
            get(hls_segment_handler).head(hls_segment_handler),
        )
        .route("/{key}/{file}", get(stream_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>")
}

async fn fallback_handler(method: Method, uri: Uri, headers: HeaderMap) -> impl IntoResponse {
    info!(
        "HTTP 404: method={} uri={} UA=\"{}\"",
        method,
        uri,
        header_str(&headers, header::USER_AGENT)
    );
    (StatusCode::NOT_FOUND, "Not found")
}

async fn media_api_handler(State(state): State<Arc<AppState>>) -> Json<Vec<MediaEntry>> {
    Json(state.catalog.entries().to_vec())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionView {
    pub key: String,
    pub id: u64,
    pub start_segment: usize,
    pub age_secs: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionsView {
    pub sessions: Vec<SessionView>,
    pub direct_streams: usize,
}

async fn sessions_api_handler(State(state): State<Arc<AppState>>) -> Json<SessionsView> {
    let now = SystemTime::now();
    let sessions = state
        .hls
        .supervisor()
        .sessions()
        .await
        .into_iter()
        .map(|s| SessionView {
            key: s.key.to_string(),
            id: s.id,
            start_segment: s.start_segment,
            age_secs: now.duration_since(s.started_at).unwrap_or_default().as_secs(),
        })
        .collect();
    Json(SessionsView {
        sessions,
        direct_streams: state.streamer.active(),
    })
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

async fn hls_playlist_handler(
    Path(key): Path<String>,
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, StreamError> {
    info!(
        "HTTP HLS playlist request: key={} method={} UA=\"{}\"",
        key,
        method,
        header_str(&headers, header::USER_AGENT)
    );
    let entry = state.catalog.resolve(&key)?;
    let text = state
        .hls
        .playlist(&entry.key, &entry.path, SEGMENT_URL_TEMPLATE)
        .await?
        .render();

    let builder = Response::builder()
        .header(header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE)
        .header(header::CONTENT_LENGTH, text.len().to_string())
        .header(header::CACHE_CONTROL, "no-store")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*");
    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(text)
    };
    builder.body(body).map_err(internal)
}

async fn hls_segment_handler(
    Path((key, segment)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, StreamError> {
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    info!(
        "HTTP HLS segment request: key={} method={} segment={} UA=\"{}\" Range=\"{}\"",
        key,
        method,
        segment,
        header_str(&headers, header::USER_AGENT),
        range.unwrap_or("<none>")
    );

    let entry = state.catalog.resolve(&key)?;
    let index = parse_segment_name(&segment)
        .ok_or_else(|| StreamError::invalid(format!("invalid segment name '{segment}'")))?;

    let bytes = state
        .hls
        .read_segment(&entry.key, &entry.path, index)
        .await?;
    let total = bytes.len();

    let builder = Response::builder()
        .header(header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, "no-store")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*");

    if method == Method::HEAD {
        return builder
            .header(header::CONTENT_LENGTH, total.to_string())
            .body(Body::empty())
            .map_err(internal);
    }

    // Some HLS stacks probe with a Range request before playback.
    if let Some((start, end)) = range.and_then(|r| parse_byte_range(r, total)) {
        let body = bytes::Bytes::from(bytes).slice(start..=end);
        return builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{total}"))
            .header(header::CONTENT_LENGTH, body.len().to_string())
            .body(Body::from(body))
            .map_err(internal);
    }

    // Invalid or unsatisfiable ranges fall back to the full segment.
    builder
        .header(header::CONTENT_LENGTH, total.to_string())
        .body(Body::from(bytes))
        .map_err(internal)
}

/// Parses a single `bytes=a-b` or `bytes=a-` range against a body of
/// `total` bytes. Returns inclusive bounds.
fn parse_byte_range(value: &str, total: usize) -> Option<(usize, usize)> {
    let range = value.trim().strip_prefix("bytes=")?;
    let (start, end) = range.split_once('-')?;
    let start: usize = start.trim().parse().ok()?;
    let end: usize = match end.trim() {
        "" => total.checked_sub(1)?,
        end => end.parse().ok()?,
    };
    (start <= end && end < total).then_some((start, end))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    start: Option<String>,
    resolution: Option<String>,
    codec: Option<String>,
}

async fn stream_handler(
    Path((key, file)): Path<(String, String)>,
    Query(query): Query<StreamQuery>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, StreamError> {
    info!(
        "HTTP stream request: key={} file={} query={:?} UA=\"{}\"",
        key,
        file,
        query,
        header_str(&headers, header::USER_AGENT)
    );

    let entry = state.catalog.resolve(&key)?;
    let ext = file
        .strip_prefix("stream.")
        .ok_or_else(|| StreamError::NotFound(format!("{key}/{file}")))?;
    let codec = Codec::for_extension(ext, query.codec.as_deref())?;
    let resolution = match query.resolution.as_deref() {
        Some(raw) => StreamingResolution::parse(raw)?,
        None => state.default_resolution,
    };
    let start = match query.start.as_deref() {
        Some(raw) => Some(
            raw.trim()
                .parse::<f64>()
                .map_err(|_| StreamError::invalid(format!("invalid start offset '{raw}'")))?,
        ),
        None => None,
    };

    let media = state.prober.probe(&entry.path).await?;
    if let Some(start) = start {
        if start > media.duration {
            warn!(
                "Seek past end: key={} start={} duration={:.1}",
                key, start, media.duration
            );
        }
    }

    let pipe = state.streamer.open(
        &media,
        StreamRequest {
            codec,
            start,
            resolution,
        },
    )?;

    Response::builder()
        .header(header::CONTENT_TYPE, pipe.mime_type())
        .header(header::CACHE_CONTROL, "no-store")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Body::from_stream(pipe))
        .map_err(internal)
}

fn internal(e: axum::http::Error) -> StreamError {
    StreamError::Io(std::io::Error::other(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_ranges() {
        assert_eq!(parse_byte_range("bytes=0-1", 100), Some((0, 1)));
        assert_eq!(parse_byte_range("bytes=10-", 100), Some((10, 99)));
        assert_eq!(parse_byte_range(" bytes=0-99 ", 100), Some((0, 99)));
        assert_eq!(parse_byte_range("bytes=0-100", 100), None);
        assert_eq!(parse_byte_range("bytes=5-2", 100), None);
        assert_eq!(parse_byte_range("bytes=-5", 100), None);
        assert_eq!(parse_byte_range("items=0-1", 100), None);
        assert_eq!(parse_byte_range("bytes=0-", 0), None);
    }
}
