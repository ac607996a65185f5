use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref FRAMES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_frames_total",
        "Total text frames received from the telemetry WebSocket"
    ))
    .unwrap();
    pub static ref FRAMES_DROPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_frames_dropped_total",
        "Total inbound frames dropped because they could not be parsed"
    ))
    .unwrap();
    pub static ref DISPATCH_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "monitor_dispatch_total",
            "Frames dispatched to listeners, by category"
        ),
        &["category"]
    )
    .unwrap();
    pub static ref RECONNECT_ATTEMPTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_reconnect_attempts_total",
        "Total WebSocket reconnect attempts"
    ))
    .unwrap();
    pub static ref AUTH_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_auth_failures_total",
        "Total failed login or token refresh calls"
    ))
    .unwrap();
    pub static ref TOKEN_REFRESH_TOTAL: Counter = Counter::with_opts(Opts::new(
        "monitor_token_refresh_total",
        "Total successful token refreshes"
    ))
    .unwrap();
    pub static ref CONNECTED: Gauge = Gauge::with_opts(Opts::new(
        "monitor_connected",
        "1 while the telemetry WebSocket is open"
    ))
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(FRAMES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(FRAMES_DROPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(DISPATCH_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONNECT_ATTEMPTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(AUTH_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(TOKEN_REFRESH_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CONNECTED.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
