use crate::args::ScaleFilter;

use super::SoftwareTuning;

pub fn h264_args(scale: &ScaleFilter, tuning: SoftwareTuning) -> Vec<String> {
    vec![
        "-vf".into(), format!("scale={scale}"),
        "-c:v".into(), "libx264".into(),
        "-pix_fmt".into(), "yuv420p".into(),
        "-profile:v".into(), "high".into(),
        "-level".into(), "4.2".into(),
        "-preset".into(), tuning.preset.into(),
        "-crf".into(), tuning.crf.to_string(),
    ]
}
