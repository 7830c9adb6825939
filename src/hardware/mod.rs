//! H.264 encoder backend selection.
//!
//! Only the H.264 paths (HLS segments and the MP4 pipe) can be offloaded to
//! hardware; every other codec in the table is software-only.

use serde::Deserialize;

use crate::args::ScaleFilter;

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "macos")]
pub mod macos;

pub mod cpu;

/// Operator-facing setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HwAccel {
    #[default]
    Auto,
    Cpu,
    Vaapi,
    #[value(name = "videotoolbox")]
    VideoToolbox,
}

/// The encoder actually used once `auto` has been resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum H264Backend {
    Cpu,
    Vaapi,
    VideoToolbox,
}

/// Rate-control knobs for the software encoder. Hardware encoders use fixed
/// bitrate caps instead.
#[derive(Debug, Clone, Copy)]
pub struct SoftwareTuning {
    pub preset: &'static str,
    pub crf: u8,
}

pub fn detect(configured: HwAccel) -> H264Backend {
    match configured {
        HwAccel::Cpu => H264Backend::Cpu,
        HwAccel::Vaapi => H264Backend::Vaapi,
        HwAccel::VideoToolbox => H264Backend::VideoToolbox,
        HwAccel::Auto => detect_auto(),
    }
}

fn detect_auto() -> H264Backend {
    #[cfg(target_os = "linux")]
    {
        return linux::detect_auto();
    }

    #[cfg(target_os = "macos")]
    {
        return macos::detect_auto();
    }

    // BSDs, Windows: no probing, stay on libx264.
    #[allow(unreachable_code)]
    H264Backend::Cpu
}

/// Arguments that must precede `-i`.
pub fn global_args(backend: H264Backend) -> Vec<String> {
    #[cfg(target_os = "linux")]
    if backend == H264Backend::Vaapi {
        return linux::global_args_vaapi();
    }

    let _ = backend;
    Vec::new()
}

/// Video filter and encoder arguments for one H.264 output.
pub fn h264_args(backend: H264Backend, scale: &ScaleFilter, tuning: SoftwareTuning) -> Vec<String> {
    match backend {
        H264Backend::Cpu => cpu::h264_args(scale, tuning),
        #[cfg(target_os = "linux")]
        H264Backend::Vaapi => linux::h264_args_vaapi(scale),
        #[cfg(target_os = "macos")]
        H264Backend::VideoToolbox => macos::h264_args_videotoolbox(scale),
        // Backend configured for a different OS: fall back to software.
        #[allow(unreachable_patterns)]
        _ => cpu::h264_args(scale, tuning),
    }
}
