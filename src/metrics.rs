use lazy_static::lazy_static;
use prometheus::{
    register_gauge_vec, register_int_counter, register_int_gauge, Encoder, GaugeVec, IntCounter,
    IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref ENCODER_CPU_USAGE: GaugeVec = register_gauge_vec!(
        "vodstream_encoder_cpu_usage_percent",
        "Current CPU usage of the encoder process per content key (0-100+)",
        &["content_key"]
    )
    .unwrap();
    pub static ref ACTIVE_SESSIONS: IntGauge = register_int_gauge!(
        "vodstream_active_sessions",
        "Segment transcode sessions currently registered"
    )
    .unwrap();
    pub static ref DIRECT_STREAMS: IntGauge = register_int_gauge!(
        "vodstream_direct_streams",
        "Progressive transcodes currently piped to clients"
    )
    .unwrap();
    pub static ref SESSION_STARTS: IntCounter = register_int_counter!(
        "vodstream_session_starts_total",
        "Segment transcode sessions started"
    )
    .unwrap();
    pub static ref SESSION_RESTARTS: IntCounter = register_int_counter!(
        "vodstream_session_restarts_total",
        "Sessions replaced because a request fell outside their range"
    )
    .unwrap();
    pub static ref SEGMENT_TIMEOUTS: IntCounter = register_int_counter!(
        "vodstream_segment_timeouts_total",
        "Segment requests that gave up waiting for the encoder"
    )
    .unwrap();
}

pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
