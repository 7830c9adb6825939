use std::path::{Path, PathBuf};
use std::time::Duration;

use config::Config;
use serde::Deserialize;

use crate::args::{EncoderSettings, StreamingResolution};
use crate::hardware::{self, HwAccel};
use crate::hls::HlsOptions;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub media: MediaConfig,
    pub transcoding: TranscodingConfig,
    pub hls: HlsConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9998,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub dir: PathBuf,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("media"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TranscodingConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub max_transcode_size: StreamingResolution,
    pub hw_accel: HwAccel,
    /// Seconds per HLS segment.
    pub segment_length: u32,
}

impl Default for TranscodingConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            max_transcode_size: StreamingResolution::Original,
            hw_accel: HwAccel::Auto,
            segment_length: 2,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    pub gap_threshold: usize,
    pub segment_wait_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            gap_threshold: 10,
            segment_wait_ms: 5000,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// Unset disables the stale reaper.
    pub reap_after_secs: Option<u64>,
    pub reap_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("cache"),
            reap_after_secs: None,
            reap_interval_secs: 300,
        }
    }
}

impl Settings {
    /// Reads `path` (TOML). A missing file leaves every value at its default.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let settings = Config::builder()
            .add_source(config::File::from(path).required(false))
            .build()?;
        let settings: Settings = settings.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.transcoding.segment_length == 0 {
            anyhow::bail!("transcoding.segment_length must be at least 1 second");
        }
        if self.hls.poll_interval_ms == 0 {
            anyhow::bail!("hls.poll_interval_ms must be positive");
        }
        if self.cache.reap_after_secs.is_some() && self.cache.reap_interval_secs == 0 {
            anyhow::bail!("cache.reap_interval_secs must be positive when reaping is enabled");
        }
        Ok(())
    }

    /// Resolves the hardware backend, which probes the host.
    pub fn encoder_settings(&self, hw_accel: Option<HwAccel>) -> EncoderSettings {
        let t = &self.transcoding;
        EncoderSettings {
            ffmpeg_path: t.ffmpeg_path.clone(),
            max_transcode_size: t.max_transcode_size,
            backend: hardware::detect(hw_accel.unwrap_or(t.hw_accel)),
            segment_length: t.segment_length,
        }
    }

    pub fn hls_options(&self) -> HlsOptions {
        HlsOptions {
            gap_threshold: self.hls.gap_threshold,
            segment_wait: Duration::from_millis(self.hls.segment_wait_ms),
            poll_interval: Duration::from_millis(self.hls.poll_interval_ms),
        }
    }

    pub fn reaper(&self) -> Option<(Duration, Duration)> {
        self.cache.reap_after_secs.map(|after| {
            (
                Duration::from_secs(after),
                Duration::from_secs(self.cache.reap_interval_secs),
            )
        })
    }
}
