//! Encoder command-line construction.
//!
//! Everything here is pure: given probe results and settings it produces the
//! argument vector handed to ffmpeg. No state, no I/O.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::StreamError;
use crate::hardware::{self, H264Backend, SoftwareTuning};
use crate::probe::MediaInfo;

/// Segment file name pattern understood by both ffmpeg and the segment store.
pub const SEGMENT_PATTERN: &str = "%d.ts";
pub const ENCODER_PLAYLIST: &str = "playlist.m3u8";

const HLS_TUNING: SoftwareTuning = SoftwareTuning { preset: "superfast", crf: 23 };
const PIPE_TUNING: SoftwareTuning = SoftwareTuning { preset: "veryfast", crf: 25 };

/// Maximum size of the smaller video dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingResolution {
    Low,
    Standard,
    StandardHd,
    FullHd,
    FourK,
    #[default]
    Original,
}

impl StreamingResolution {
    /// 0 means unconstrained.
    pub fn max_dimension(self) -> u32 {
        match self {
            StreamingResolution::Low => 240,
            StreamingResolution::Standard => 480,
            StreamingResolution::StandardHd => 720,
            StreamingResolution::FullHd => 1080,
            StreamingResolution::FourK => 2160,
            StreamingResolution::Original => 0,
        }
    }

    /// Accepts the snake_case config names as well as the upper-case API names
    /// (`STANDARD_HD`).
    pub fn parse(raw: &str) -> Result<Self, StreamError> {
        match raw.to_ascii_lowercase().as_str() {
            "low" => Ok(StreamingResolution::Low),
            "standard" => Ok(StreamingResolution::Standard),
            "standard_hd" => Ok(StreamingResolution::StandardHd),
            "full_hd" => Ok(StreamingResolution::FullHd),
            "four_k" => Ok(StreamingResolution::FourK),
            "original" => Ok(StreamingResolution::Original),
            other => Err(StreamError::invalid(format!("unknown resolution '{other}'"))),
        }
    }
}

/// Value of ffmpeg's `scale=` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleFilter {
    /// Keep the source size (`iw:-2`: input width, height rounded to even).
    Original,
    Scaled { width: u32, height: u32 },
}

impl fmt::Display for ScaleFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleFilter::Original => f.write_str("iw:-2"),
            ScaleFilter::Scaled { width, height } => write!(f, "{width}:{height}"),
        }
    }
}

fn round_even(value: f64) -> u32 {
    let even = ((value / 2.0).round() as u32) * 2;
    even.max(2)
}

/// Scales the smaller dimension down to `max_size`, keeping aspect ratio and
/// rounding the other dimension to an even number.
pub fn calculate_scale(width: u32, height: u32, max_size: u32) -> ScaleFilter {
    let smaller = width.min(height);
    if max_size == 0 || max_size >= smaller || smaller == 0 {
        return ScaleFilter::Original;
    }

    let ratio = max_size as f64 / smaller as f64;
    if width > height {
        ScaleFilter::Scaled {
            width: round_even(width as f64 * ratio),
            height: max_size,
        }
    } else {
        ScaleFilter::Scaled {
            width: max_size,
            height: round_even(height as f64 * ratio),
        }
    }
}

/// Codec/container pairs for progressive delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    Hevc,
    Vp9,
    Vp8,
    /// Copy the video stream, transcode only the audio, serve as Matroska.
    MkvAudio,
}

impl Codec {
    /// Picks the codec for a `stream.<ext>` request, with an optional
    /// `codec=` hint selecting the alternative for that container.
    pub fn for_extension(ext: &str, hint: Option<&str>) -> Result<Self, StreamError> {
        match (ext.to_ascii_lowercase().as_str(), hint.map(str::to_ascii_lowercase).as_deref()) {
            ("mp4", None | Some("h264")) => Ok(Codec::H264),
            ("mp4", Some("hevc" | "h265")) => Ok(Codec::Hevc),
            ("webm", None | Some("vp9")) => Ok(Codec::Vp9),
            ("webm", Some("vp8")) => Ok(Codec::Vp8),
            ("mkv", None | Some("copy")) => Ok(Codec::MkvAudio),
            (ext, Some(hint)) => Err(StreamError::invalid(format!(
                "codec '{hint}' is not available for .{ext}"
            ))),
            (ext, None) => Err(StreamError::invalid(format!("unsupported stream format .{ext}"))),
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Codec::H264 | Codec::Hevc => "video/mp4",
            Codec::Vp9 | Codec::Vp8 => "video/webm",
            Codec::MkvAudio => "video/x-matroska",
        }
    }

    fn format(self) -> &'static str {
        match self {
            Codec::H264 | Codec::Hevc => "mp4",
            Codec::Vp9 | Codec::Vp8 => "webm",
            Codec::MkvAudio => "matroska",
        }
    }

    fn copies_video(self) -> bool {
        matches!(self, Codec::MkvAudio)
    }

    fn video_args(self, backend: H264Backend, scale: &ScaleFilter) -> Vec<String> {
        let list = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        match self {
            Codec::H264 => {
                let mut args = hardware::h264_args(backend, scale, PIPE_TUNING);
                args.extend(list(&["-movflags", "frag_keyframe+empty_moov"]));
                args
            }
            Codec::Hevc => {
                let mut args = vec!["-vf".to_string(), format!("scale={scale}")];
                args.extend(list(&[
                    "-c:v", "libx265",
                    "-movflags", "frag_keyframe+empty_moov",
                    "-preset", "veryfast",
                    "-crf", "30",
                ]));
                args
            }
            Codec::Vp9 => {
                let mut args = vec!["-vf".to_string(), format!("scale={scale}")];
                args.extend(list(&[
                    "-c:v", "libvpx-vp9",
                    "-deadline", "realtime",
                    "-cpu-used", "5",
                    "-row-mt", "1",
                    "-crf", "30",
                    "-b:v", "0",
                ]));
                args
            }
            Codec::Vp8 => {
                let mut args = vec!["-vf".to_string(), format!("scale={scale}")];
                args.extend(list(&[
                    "-c:v", "libvpx",
                    "-deadline", "realtime",
                    "-cpu-used", "5",
                    "-crf", "12",
                    "-b:v", "3M",
                    "-pix_fmt", "yuv420p",
                ]));
                args
            }
            Codec::MkvAudio => list(&["-c:v", "copy"]),
        }
    }

    fn audio_args(self) -> Vec<String> {
        match self {
            Codec::MkvAudio => ["-c:a", "libopus", "-b:a", "96k", "-vbr", "on"],
            Codec::Vp9 | Codec::Vp8 => ["-c:a", "libopus", "-b:a", "128k", "-vbr", "on"],
            Codec::H264 | Codec::Hevc => ["-c:a", "aac", "-b:a", "160k", "-strict", "-2"],
        }
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

/// Process-wide encoder settings.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub ffmpeg_path: PathBuf,
    pub max_transcode_size: StreamingResolution,
    pub backend: H264Backend,
    /// Seconds per HLS segment.
    pub segment_length: u32,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            max_transcode_size: StreamingResolution::Original,
            backend: H264Backend::Cpu,
            segment_length: 2,
        }
    }
}

impl EncoderSettings {
    /// Seek offset, in seconds, of the first frame of `segment`.
    pub fn segment_start_time(&self, segment: usize) -> u64 {
        segment as u64 * self.segment_length as u64
    }
}

fn seek_value(seconds: f64) -> String {
    let formatted = format!("{seconds:.3}");
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

/// Arguments for a segmenting session writing into `output_dir`, starting at
/// `start_segment`.
pub fn hls_args(
    settings: &EncoderSettings,
    media: &MediaInfo,
    output_dir: &Path,
    start_segment: usize,
) -> Vec<String> {
    let scale = calculate_scale(media.width, media.height, settings.max_transcode_size.max_dimension());
    let mut args = vec!["-hide_banner".to_string(), "-v".into(), "error".into()];
    args.extend(hardware::global_args(settings.backend));

    if start_segment > 0 {
        args.extend(["-ss".into(), settings.segment_start_time(start_segment).to_string()]);
    }
    args.extend(["-i".into(), media.path.to_string_lossy().into_owned()]);

    args.extend(hardware::h264_args(settings.backend, &scale, HLS_TUNING));
    args.extend([
        "-r".into(), "30".into(),
        "-g".into(), (settings.segment_length * 30).to_string(),
        "-force_key_frames".into(),
        format!("expr:gte(t,n_forced*{})", settings.segment_length),
    ]);

    if media.has_audio() {
        args.extend(["-c:a".into(), "aac".into(), "-ac".into(), "2".into(), "-strict".into(), "-2".into()]);
    } else {
        args.push("-an".into());
    }

    args.extend([
        "-copyts".into(),
        "-avoid_negative_ts".into(), "disabled".into(),
        "-f".into(), "hls".into(),
        "-start_number".into(), start_segment.to_string(),
        "-hls_time".into(), settings.segment_length.to_string(),
        "-hls_segment_type".into(), "mpegts".into(),
        "-hls_playlist_type".into(), "vod".into(),
        "-hls_list_size".into(), "0".into(),
        "-hls_flags".into(), "temp_file".into(),
        "-hls_segment_filename".into(),
        output_dir.join(SEGMENT_PATTERN).to_string_lossy().into_owned(),
        output_dir.join(ENCODER_PLAYLIST).to_string_lossy().into_owned(),
    ]);
    args
}

/// Arguments for a progressive transcode written to stdout.
pub fn stream_args(
    settings: &EncoderSettings,
    media: &MediaInfo,
    codec: Codec,
    start: Option<f64>,
    resolution: StreamingResolution,
) -> Vec<String> {
    let mut args = vec!["-hide_banner".to_string(), "-v".into(), "error".into()];
    if codec == Codec::H264 {
        args.extend(hardware::global_args(settings.backend));
    }
    if let Some(start) = start.filter(|s| *s > 0.0) {
        args.extend(["-ss".into(), seek_value(start)]);
    }
    args.extend(["-i".into(), media.path.to_string_lossy().into_owned()]);

    let scale = if codec.copies_video() {
        ScaleFilter::Original
    } else {
        calculate_scale(media.width, media.height, resolution.max_dimension())
    };
    args.extend(codec.video_args(settings.backend, &scale));

    if media.has_audio() {
        args.extend(codec.audio_args());
        // 5.1 sources otherwise fail in most browser decoders.
        args.extend(["-ac".into(), "2".into()]);
    } else {
        args.push("-an".into());
    }

    args.extend(["-f".into(), codec.format().into(), "pipe:1".into()]);
    args
}
