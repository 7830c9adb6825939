use tracing::info;

use crate::args::ScaleFilter;

use super::H264Backend;

pub fn detect_auto() -> H264Backend {
    info!("Auto-detected macOS, using h264_videotoolbox");
    H264Backend::VideoToolbox
}

pub fn h264_args_videotoolbox(scale: &ScaleFilter) -> Vec<String> {
    vec![
        "-vf".into(), format!("scale={scale}"),
        "-pix_fmt".into(), "yuv420p".into(),
        "-c:v".into(), "h264_videotoolbox".into(),
        "-b:v".into(), "6M".into(),
        "-maxrate".into(), "8M".into(),
        "-bufsize".into(), "8M".into(),
        "-profile:v".into(), "high".into(),
        // Software fallback when the hardware runs out of sessions.
        "-allow_sw".into(), "1".into(),
        "-realtime".into(), "true".into(),
    ]
}
