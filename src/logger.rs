use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// RFC 3339 UTC timestamps
struct UtcTimer;

impl fmt::time::FormatTime for UtcTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Utc::now().to_rfc3339())
    }
}

/// Console logging, filtered by `RUST_LOG` (default `info`).
pub fn init_logger() {
    let console_layer = fmt::Layer::new()
        .with_target(false)
        .with_level(true)
        .with_timer(UtcTimer);

    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_layer)
        .try_init();
}
