use lazy_static::lazy_static;
use prometheus::{
    register_gauge_vec, register_int_counter_vec, register_int_gauge, Encoder, GaugeVec,
    IntCounterVec, IntGauge, TextEncoder,
};
use serde::Deserialize;

lazy_static! {
    pub static ref PROXY_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "zaptv_proxy_requests_total",
        "Delivery requests by route (playlist, deinterlace, passthrough, transcode)",
        &["route"]
    )
    .unwrap();
    pub static ref STREAMED_BYTES: IntCounterVec = register_int_counter_vec!(
        "zaptv_streamed_bytes_total",
        "Bytes written to clients by route",
        &["route"]
    )
    .unwrap();
    pub static ref REMUX_ACTIVE_JOBS: IntGauge = register_int_gauge!(
        "zaptv_remux_active_jobs",
        "Remux jobs currently registered (one live ffmpeg each)"
    )
    .unwrap();
    pub static ref FFMPEG_CPU_USAGE: GaugeVec = register_gauge_vec!(
        "zaptv_ffmpeg_cpu_usage_percent",
        "Current CPU usage of the ffmpeg process per remux job (0-100+)",
        &["job"]
    )
    .unwrap();
}

pub fn gather_metrics() -> String {
    // Registration is lazy; make sure the gauges show up before first use.
    lazy_static::initialize(&REMUX_ACTIVE_JOBS);
    lazy_static::initialize(&PROXY_REQUESTS);
    lazy_static::initialize(&STREAMED_BYTES);
    lazy_static::initialize(&FFMPEG_CPU_USAGE);

    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# failed to encode metrics: {e}\n");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitoringConfig {
    #[serde(default = "default_monitoring_enabled")]
    pub enabled: bool,
    #[serde(default = "default_console_log_bandwidth")]
    pub console_log_bandwidth: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: default_monitoring_enabled(),
            console_log_bandwidth: default_console_log_bandwidth(),
        }
    }
}

fn default_monitoring_enabled() -> bool {
    true
}

fn default_console_log_bandwidth() -> bool {
    false
}
