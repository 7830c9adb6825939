//! Progressive transcodes piped straight into an HTTP response body.
//!
//! Each request gets its own encoder process; nothing is registered or
//! shared. The process lives exactly as long as the [`PipeStream`] returned
//! to the caller: dropping the stream (client disconnect) terminates it.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::Stream;
use tokio::process::ChildStdout;
use tokio::sync::watch;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::args::{stream_args, Codec, EncoderSettings, StreamingResolution};
use crate::error::StreamError;
use crate::metrics::DIRECT_STREAMS;
use crate::probe::MediaInfo;
use crate::process::{drain_output, wait_or_kill, EncoderCommand, OutputRing};

const BANDWIDTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct StreamRequest {
    pub codec: Codec,
    /// Seek offset in seconds.
    pub start: Option<f64>,
    pub resolution: StreamingResolution,
}

#[derive(Clone)]
pub struct DirectStreamer {
    settings: Arc<EncoderSettings>,
    next_id: Arc<AtomicU64>,
    active: Arc<AtomicUsize>,
}

impl DirectStreamer {
    pub fn new(settings: EncoderSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            next_id: Arc::new(AtomicU64::new(1)),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Encoder processes not yet reaped.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Spawns the encoder and hands back its stdout as a byte stream.
    pub fn open(&self, media: &MediaInfo, request: StreamRequest) -> Result<PipeStream, StreamError> {
        if let Some(start) = request.start {
            if !start.is_finite() || start < 0.0 {
                return Err(StreamError::invalid(format!("invalid start offset {start}")));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let label = format!(
            "stream-{id}:{}",
            media
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        );

        let command = EncoderCommand::new(
            self.settings.ffmpeg_path.clone(),
            stream_args(&self.settings, media, request.codec, request.start, request.resolution),
        );
        let command_line = command.command_line();
        debug!("Streaming via: {}", command_line);

        let mut child = command.to_command().spawn().map_err(|e| {
            error!("Failed to spawn encoder for {}: {} (command: {})", label, e, command_line);
            StreamError::ProcessSpawn(format!("{}: {e}", command.program.display()))
        })?;
        #[cfg(test)]
        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StreamError::ProcessSpawn("encoder stdout was not captured".into()))?;

        let stderr = OutputRing::default();
        let drain = child
            .stderr
            .take()
            .map(|pipe| drain_output(pipe, stderr.clone(), label.clone(), "stderr"));

        self.active.fetch_add(1, Ordering::AcqRel);
        DIRECT_STREAMS.inc();

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let reap_label = label.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            let (status, stop_requested) = wait_or_kill(&mut child, &mut stop_rx).await;
            if let Some(drain) = drain {
                let _ = drain.await;
            }
            match status {
                Ok(_) if stop_requested => info!("Direct stream {} closed by client", reap_label),
                Ok(status) if status.success() => info!("Direct stream {} finished", reap_label),
                Ok(status) => error!(
                    "Direct stream {} failed: status={} command=<{}> stderr=\n{}",
                    reap_label,
                    status,
                    command_line,
                    stderr.contents().await
                ),
                Err(e) => warn!("Direct stream {} wait() failed: {}", reap_label, e),
            }
            active.fetch_sub(1, Ordering::AcqRel);
            DIRECT_STREAMS.dec();
        });

        info!(
            "Direct stream {} started: codec={:?} start={:?} resolution={:?}",
            label, request.codec, request.start, request.resolution
        );

        Ok(PipeStream {
            inner: ReaderStream::new(stdout),
            _guard: ProcessGuard { stop: stop_tx },
            #[cfg(test)]
            pid,
            mime_type: request.codec.mime_type(),
            label,
            last_log_time: Instant::now(),
            bytes_since_last_log: 0,
        })
    }
}

/// Terminates the encoder when dropped. The reap task does the killing and
/// the bookkeeping.
struct ProcessGuard {
    stop: watch::Sender<bool>,
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

/// Encoder stdout as a body stream. Owns the process.
pub struct PipeStream {
    inner: ReaderStream<ChildStdout>,
    _guard: ProcessGuard,
    #[cfg(test)]
    pid: Option<u32>,
    mime_type: &'static str,
    label: String,
    last_log_time: Instant,
    bytes_since_last_log: usize,
}

impl PipeStream {
    pub fn mime_type(&self) -> &'static str {
        self.mime_type
    }
}

impl Stream for PipeStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let res = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(Some(Ok(ref bytes))) = res {
            self.bytes_since_last_log += bytes.len();
            let elapsed = self.last_log_time.elapsed();
            if elapsed >= BANDWIDTH_LOG_INTERVAL {
                let rate_kb = (self.bytes_since_last_log as f64 / elapsed.as_secs_f64()) / 1024.0;
                debug!("Stream bandwidth: {} rate={:.2} KB/s", self.label, rate_kb);
                self.last_log_time = Instant::now();
                self.bytes_since_last_log = 0;
            }
        }
        res
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::sample_media;
    use futures::StreamExt;
    use std::path::PathBuf;

    fn streamer_running(program: &str) -> DirectStreamer {
        DirectStreamer::new(EncoderSettings {
            ffmpeg_path: PathBuf::from(program),
            ..EncoderSettings::default()
        })
    }

    async fn wait_until_reaped(streamer: &DirectStreamer) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while streamer.active() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("encoder still running 2s after the pipe closed");
    }

    fn request() -> StreamRequest {
        StreamRequest {
            codec: Codec::H264,
            start: None,
            resolution: StreamingResolution::Original,
        }
    }

    #[tokio::test]
    async fn missing_encoder_is_a_spawn_error() {
        let streamer = DirectStreamer::new(EncoderSettings {
            ffmpeg_path: PathBuf::from("/nonexistent/ffmpeg-binary"),
            ..EncoderSettings::default()
        });
        let err = streamer.open(&sample_media(), request()).err().unwrap();
        assert!(matches!(err, StreamError::ProcessSpawn(_)));
    }

    #[tokio::test]
    async fn negative_start_is_rejected() {
        let streamer = DirectStreamer::new(EncoderSettings::default());
        let bad = StreamRequest {
            start: Some(-3.0),
            ..request()
        };
        let err = streamer.open(&sample_media(), bad).err().unwrap();
        assert!(matches!(err, StreamError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn forwards_encoder_stdout() {
        // `echo` ignores the encoder arguments and prints them back.
        let streamer = streamer_running("echo");
        let mut stream = streamer.open(&sample_media(), request()).unwrap();
        assert_eq!(stream.mime_type(), "video/mp4");
        assert_eq!(streamer.active(), 1);

        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("/media/movie.mkv"));
        assert!(text.trim_end().ends_with("pipe:1"));
        drop(stream);
        wait_until_reaped(&streamer).await;
    }

    #[tokio::test]
    async fn client_disconnect_kills_encoder() {
        // `yes` repeats its arguments until killed.
        let streamer = streamer_running("yes");
        let mut stream = streamer.open(&sample_media(), request()).unwrap();
        let pid = stream.pid.unwrap();

        let chunk = stream.next().await.unwrap().unwrap();
        assert!(!chunk.is_empty());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(streamer.active(), 1);

        drop(stream);
        wait_until_reaped(&streamer).await;
        if cfg!(target_os = "linux") {
            assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
        }
    }

    #[tokio::test]
    async fn dropping_guard_signals_stop() {
        let (stop, mut rx) = watch::channel(false);
        drop(ProcessGuard { stop });
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
