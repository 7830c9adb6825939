//! MediaInfo provider.
//!
//! The engine only needs a handful of facts about a source: duration,
//! dimensions and which codecs it carries. [`FfprobeProber`] obtains them by
//! running `ffprobe`; [`CachedProber`] memoises results per path so the
//! subprocess runs once per source rather than once per request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::StreamError;

#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub path: PathBuf,
    /// Seconds.
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub format_name: Option<String>,
}

impl MediaInfo {
    pub fn has_audio(&self) -> bool {
        self.audio_codec.is_some()
    }
}

#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, StreamError>;
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    format_name: Option<String>,
}

fn parse_ffprobe_json(path: &Path, json: &[u8]) -> Result<MediaInfo, StreamError> {
    let output: FfprobeOutput = serde_json::from_slice(json)
        .map_err(|e| StreamError::probe(path, format!("unparseable ffprobe output: {e}")))?;

    let video = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| StreamError::probe(path, "no video stream"))?;
    let audio = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let (width, height) = match (video.width, video.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(StreamError::probe(path, "video stream has no dimensions")),
    };

    // Container duration first, stream duration for formats that only report it per stream.
    let duration = output
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or(video.duration.as_deref())
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
        .ok_or_else(|| StreamError::probe(path, "unknown duration"))?;

    Ok(MediaInfo {
        path: path.to_path_buf(),
        duration,
        width,
        height,
        video_codec: video.codec_name.clone(),
        audio_codec: audio.and_then(|a| a.codec_name.clone()),
        format_name: output.format.and_then(|f| f.format_name),
    })
}

pub struct FfprobeProber {
    ffprobe_path: PathBuf,
}

impl FfprobeProber {
    pub fn new(ffprobe_path: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
        }
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, StreamError> {
        let output = Command::new(&self.ffprobe_path)
            .args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StreamError::probe(path, format!("failed to run ffprobe: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StreamError::probe(
                path,
                format!("ffprobe exited with {}: {}", output.status, stderr.trim()),
            ));
        }

        let info = parse_ffprobe_json(path, &output.stdout)?;
        debug!(
            "Probed {}: {}x{} {:.2}s video={:?} audio={:?}",
            path.display(),
            info.width,
            info.height,
            info.duration,
            info.video_codec,
            info.audio_codec
        );
        Ok(info)
    }
}

/// Memoises successful probes. Failures are not cached.
pub struct CachedProber {
    inner: Arc<dyn MediaProber>,
    cache: RwLock<HashMap<PathBuf, MediaInfo>>,
}

impl CachedProber {
    pub fn new(inner: Arc<dyn MediaProber>) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl MediaProber for CachedProber {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, StreamError> {
        if let Some(info) = self.cache.read().await.get(path) {
            return Ok(info.clone());
        }
        let info = self.inner.probe(path).await?;
        self.cache
            .write()
            .await
            .insert(path.to_path_buf(), info.clone());
        Ok(info)
    }
}
