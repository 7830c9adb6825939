//! Error taxonomy for the streaming engine.
//!
//! Every failure that can reach an HTTP client funnels into [`StreamError`].
//! Handlers turn it into a response through [`IntoResponse`], which only ever
//! carries a short message: encoder stderr is logged where it is captured and
//! never forwarded to clients.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The source could not be probed (unreadable or malformed file).
    #[error("probe failed for {path}: {message}")]
    Probe { path: String, message: String },

    /// The encoder process (or its output directory) could not be created.
    #[error("failed to start encoder: {0}")]
    ProcessSpawn(String),

    /// The encoder exited abnormally while a request depended on its output.
    #[error("encoder exited abnormally: {0}")]
    ProcessRuntime(String),

    /// A segment did not appear within the configured wait ceiling.
    #[error("timed out waiting for segment {segment} of {key}")]
    SegmentTimeout { key: String, segment: usize },

    /// Malformed content key, segment index, seek offset or format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The content key is well-formed but unknown.
    #[error("{0} not found")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StreamError {
    pub fn probe(path: impl AsRef<std::path::Path>, message: impl Into<String>) -> Self {
        StreamError::Probe {
            path: path.as_ref().display().to_string(),
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        StreamError::InvalidRequest(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            StreamError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            StreamError::NotFound(_) => StatusCode::NOT_FOUND,
            StreamError::SegmentTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            StreamError::ProcessRuntime(_) => StatusCode::BAD_GATEWAY,
            StreamError::Probe { .. } | StreamError::ProcessSpawn(_) | StreamError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether a client may simply retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StreamError::SegmentTimeout { .. })
    }

    fn public_message(&self) -> String {
        match self {
            StreamError::Probe { .. } => "unable to read source media".to_string(),
            StreamError::ProcessSpawn(_) => "unable to start transcoder".to_string(),
            StreamError::ProcessRuntime(_) => "transcoder failed".to_string(),
            StreamError::SegmentTimeout { .. } => {
                "timed out waiting for segment to be generated".to_string()
            }
            StreamError::InvalidRequest(msg) => msg.clone(),
            StreamError::NotFound(what) => format!("{what} not found"),
            StreamError::Io(_) => "internal error".to_string(),
        }
    }
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        let mut builder = Response::builder()
            .status(self.status_code())
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(header::CACHE_CONTROL, "no-store");
        if self.is_retryable() {
            builder = builder.header(header::RETRY_AFTER, "1");
        }
        builder
            .body(Body::from(self.public_message()))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(StreamError::invalid("x").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            StreamError::NotFound("media".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            StreamError::SegmentTimeout { key: "k".into(), segment: 3 }.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            StreamError::ProcessRuntime("boom".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            StreamError::ProcessSpawn("no ffmpeg".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn response_hides_encoder_output() {
        let err = StreamError::ProcessRuntime("Invalid data found when processing input".into());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }

    #[test]
    fn timeout_is_retryable() {
        let response = StreamError::SegmentTimeout { key: "k".into(), segment: 1 }.into_response();
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
    }
}
