use anyhow::Context;
use axum::{Router, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::auth::JwtVerifier;
use crate::config::Args;
use crate::handlers::{health_handler, metrics_handler, proxy_handler};
use crate::proxy::Forwarder;
use crate::rate_limit::{RateLimiter, bucket_sweeper};
use crate::routes::Dispatcher;
use crate::state::AppState;

// Local endpoints first; everything else is dispatched to an upstream
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(proxy_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn build_state(args: &Args) -> anyhow::Result<AppState> {
    let limiter = Arc::new(RateLimiter::new(args.limiter_config()));
    let verifier = Arc::new(JwtVerifier::new(args.jwt_secret.as_bytes()));
    let forwarder = Forwarder::new(args.upstream_timeout()).context("Failed to build HTTP client")?;

    Ok(AppState::new(Dispatcher::new(args.routes(), verifier, limiter, forwarder)))
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    let state = Arc::new(build_state(&args)?);

    let limiter_config = state.dispatcher.limiter().config();
    if limiter_config.is_enabled() {
        tracing::info!(
            rps = limiter_config.refill_rate_per_second,
            burst = limiter_config.burst_capacity,
            "Rate limiting enabled"
        );
        if let Some(every) = args.sweep_interval() {
            tokio::spawn(bucket_sweeper(state.dispatcher.limiter().clone(), every));
        }
    } else {
        tracing::warn!("Rate limiting disabled (rps or burst is 0)");
    }

    for route in state.dispatcher.routes() {
        tracing::info!(
            path = ?route.path,
            prefix = %route.target.path_prefix,
            upstream = %route.target.upstream_base_url,
            auth = route.policy.requires_auth,
            rate_limited = route.policy.rate_limited,
            "Route registered"
        );
    }

    let app = router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("Gateway running on http://localhost:{}", args.port);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutting down gateway...");
}
