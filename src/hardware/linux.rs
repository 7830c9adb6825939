use std::path::Path;

use tracing::{info, warn};

use crate::args::ScaleFilter;

use super::H264Backend;

const RENDER_NODE: &str = "/dev/dri/renderD128";

pub fn detect_auto() -> H264Backend {
    let path = Path::new(RENDER_NODE);
    if !path.exists() {
        info!("Auto-detection: no VAAPI device at {:?}, using libx264", path);
        return H264Backend::Cpu;
    }
    match std::fs::File::open(path) {
        Ok(_) => {
            info!("Auto-detected VAAPI device at {:?}, using h264_vaapi", path);
            H264Backend::Vaapi
        }
        Err(e) => {
            warn!(
                "Auto-detection: VAAPI device at {:?} cannot be opened ({}), using libx264. Check render group membership.",
                path, e
            );
            H264Backend::Cpu
        }
    }
}

pub fn global_args_vaapi() -> Vec<String> {
    vec![
        "-init_hw_device".into(), format!("vaapi=va:{RENDER_NODE}"),
        "-filter_hw_device".into(), "va".into(),
    ]
}

pub fn h264_args_vaapi(scale: &ScaleFilter) -> Vec<String> {
    vec![
        // Scale in software, then upload; nv12 is what the encoder accepts.
        "-vf".into(), format!("scale={scale},format=nv12,hwupload"),
        "-c:v".into(), "h264_vaapi".into(),
        "-b:v".into(), "6M".into(),
        "-maxrate".into(), "8M".into(),
        "-bufsize".into(), "8M".into(),
    ]
}
