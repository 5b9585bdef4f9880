use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, TextEncoder, register_counter,
    register_counter_vec, register_gauge, register_histogram,
};

lazy_static! {
    pub static ref REQUEST_TOTAL: CounterVec = register_counter_vec!(
        "gateway_requests_total",
        "Total number of proxied requests by route and outcome",
        &["route", "outcome"]
    )
    .unwrap();
    pub static ref RATE_LIMITED: Counter =
        register_counter!("gateway_rate_limited_total", "Requests rejected by the rate limiter").unwrap();
    pub static ref AUTH_FAILURES: Counter =
        register_counter!("gateway_auth_failures_total", "Requests rejected by the token verifier").unwrap();
    pub static ref UPSTREAM_ERRORS: Counter =
        register_counter!("gateway_upstream_errors_total", "Upstream transport failures").unwrap();
    pub static ref UPSTREAM_LATENCY: Histogram = register_histogram!(
        "gateway_upstream_latency_seconds",
        "Time until upstream response headers in seconds"
    )
    .unwrap();
    pub static ref ACTIVE_BUCKETS: Gauge =
        register_gauge!("gateway_rate_limit_buckets", "Current number of rate limit buckets").unwrap();
}

// Render every registered metric in the text exposition format
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
