use clap::Parser;
use std::time::Duration;

use crate::proxy::normalize_base_url;
use crate::rate_limit::LimiterConfig;
use crate::routes::Route;

// CLI argument structure; every flag can also come from the environment
#[derive(Parser, Debug, Clone)]
#[command(name = "api-gateway")]
#[command(about = "Authenticating, rate limiting reverse proxy for backend services")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    // Upstream for /api/auth/ (unauthenticated)
    #[arg(long, env = "AUTH_SERVICE_URL", default_value = "http://localhost:8081")]
    pub auth_service_url: String,

    // Upstream for /api/users/ (bearer token required)
    #[arg(long, env = "USER_SERVICE_URL", default_value = "http://localhost:8082")]
    pub user_service_url: String,

    // Token refill rate per client; 0 disables rate limiting
    #[arg(long, env = "RATE_LIMIT_RPS", default_value_t = 10.0, value_parser = parse_rate)]
    pub rate_limit_rps: f64,

    // Bucket size per client; 0 disables rate limiting
    #[arg(long, env = "RATE_LIMIT_BURST", default_value_t = 20)]
    pub rate_limit_burst: u32,

    // Shared HS256 signing secret
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    // Max wait for upstream response headers, in seconds
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value_t = 30)]
    pub upstream_timeout: u64,

    // Idle bucket sweep interval in seconds; 0 disables the sweeper
    #[arg(long, env = "BUCKET_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval: u64,
}

fn parse_rate(s: &str) -> Result<f64, String> {
    let rate: f64 = s.parse().map_err(|e| format!("invalid rate '{}': {}", s, e))?;
    if !rate.is_finite() || rate < 0.0 {
        return Err(format!("rate must be a finite number >= 0, got {}", s));
    }
    Ok(rate)
}

impl Args {
    pub fn limiter_config(&self) -> LimiterConfig {
        LimiterConfig::new(self.rate_limit_rps, self.rate_limit_burst)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval > 0).then(|| Duration::from_secs(self.sweep_interval))
    }

    // Route table for the auth and user services
    pub fn routes(&self) -> Vec<Route> {
        let auth = normalize_base_url(&self.auth_service_url);
        let users = normalize_base_url(&self.user_service_url);

        vec![
            Route::exact("/api/auth/health", &auth).unlimited().rewrite_to("/health"),
            Route::exact("/api/users/health", &users).unlimited().rewrite_to("/health"),
            Route::prefix("/api/auth/", &auth),
            Route::prefix("/api/users/", &users).authenticated(),
        ]
    }
}
