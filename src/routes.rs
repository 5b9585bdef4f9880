use axum::{extract::Request, response::Response};
use std::sync::Arc;

use crate::auth::CredentialVerifier;
use crate::client_ip::client_key;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::{AUTH_FAILURES, RATE_LIMITED, REQUEST_TOTAL};
use crate::proxy::{Forwarder, ProxyTarget};
use crate::rate_limit::RateLimiter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMatch {
    Prefix(String),
    Exact(String),
}

impl PathMatch {
    fn pattern(&self) -> &str {
        match self {
            PathMatch::Prefix(p) | PathMatch::Exact(p) => p,
        }
    }

    fn matches(&self, path: &str) -> bool {
        match self {
            PathMatch::Exact(p) => path == p,
            // "/api/users" matches "/api/users" and "/api/users/..", not "/api/usersX"
            PathMatch::Prefix(p) => match path.strip_prefix(p.as_str()) {
                Some(rest) => p.ends_with('/') || rest.is_empty() || rest.starts_with('/'),
                None => false,
            },
        }
    }
}

// Which gates a route runs before forwarding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutePolicy {
    pub requires_auth: bool,
    pub rate_limited: bool,
}

#[derive(Debug, Clone)]
pub struct Route {
    pub path: PathMatch,
    pub target: ProxyTarget,
    pub policy: RoutePolicy,
    // fixed upstream path instead of the inbound one
    pub upstream_path: Option<String>,
}

impl Route {
    pub fn prefix(prefix: &str, upstream_base_url: &str) -> Self {
        Self {
            path: PathMatch::Prefix(prefix.to_string()),
            target: ProxyTarget::new(upstream_base_url, prefix),
            policy: RoutePolicy {
                requires_auth: false,
                rate_limited: true,
            },
            upstream_path: None,
        }
    }

    pub fn exact(path: &str, upstream_base_url: &str) -> Self {
        Self {
            path: PathMatch::Exact(path.to_string()),
            ..Self::prefix(path, upstream_base_url)
        }
    }

    pub fn authenticated(mut self) -> Self {
        self.policy.requires_auth = true;
        self
    }

    pub fn unlimited(mut self) -> Self {
        self.policy.rate_limited = false;
        self
    }

    pub fn rewrite_to(mut self, upstream_path: &str) -> Self {
        self.upstream_path = Some(upstream_path.to_string());
        self
    }

    fn label(&self) -> &str {
        self.path.pattern()
    }
}

/// Binds routes to the auth gate, the rate limiter and the forwarder.
///
/// Gates run in order: verifier (protected routes only), limiter, forwarder.
/// A rejected request never reaches the upstream, and an unauthenticated one
/// never spends a rate limit token.
pub struct Dispatcher {
    routes: Vec<Route>,
    verifier: Arc<dyn CredentialVerifier>,
    limiter: Arc<RateLimiter>,
    forwarder: Forwarder,
}

impl Dispatcher {
    pub fn new(
        routes: Vec<Route>,
        verifier: Arc<dyn CredentialVerifier>,
        limiter: Arc<RateLimiter>,
        forwarder: Forwarder,
    ) -> Self {
        Self {
            routes,
            verifier,
            limiter,
            forwarder,
        }
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    // Longest matching pattern; first declared wins a tie
    pub fn resolve(&self, path: &str) -> Option<&Route> {
        let mut best: Option<&Route> = None;
        for route in &self.routes {
            if !route.path.matches(path) {
                continue;
            }
            if best.is_none_or(|b| route.path.pattern().len() > b.path.pattern().len()) {
                best = Some(route);
            }
        }
        best
    }

    pub async fn dispatch(&self, request: Request, remote_addr: Option<&str>) -> GatewayResult<Response> {
        let path = request.uri().path().to_string();
        let Some(route) = self.resolve(&path) else {
            tracing::debug!(path = %path, "No route for path");
            REQUEST_TOTAL.with_label_values(&["none", "not_found"]).inc();
            return Err(GatewayError::RouteNotFound);
        };

        let result = self.run_route(route, &path, request, remote_addr).await;

        let outcome = match &result {
            Ok(_) => "forwarded",
            Err(e) => e.outcome(),
        };
        REQUEST_TOTAL.with_label_values(&[route.label(), outcome]).inc();

        result
    }

    async fn run_route(
        &self,
        route: &Route,
        path: &str,
        request: Request,
        remote_addr: Option<&str>,
    ) -> GatewayResult<Response> {
        let subject = if route.policy.requires_auth {
            let authorization = request
                .headers()
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();

            match self.verifier.verify(authorization) {
                Ok(subject) => Some(subject),
                Err(e) => {
                    AUTH_FAILURES.inc();
                    if authorization.is_empty() {
                        tracing::debug!(path = %path, "Missing Authorization header");
                    } else {
                        tracing::warn!(path = %path, error = %e, "Token verification failed");
                    }
                    return Err(GatewayError::Unauthorized(e));
                }
            }
        } else {
            None
        };

        if route.policy.rate_limited {
            let key = client_key(request.headers(), remote_addr);
            if !self.limiter.allow(&key) {
                RATE_LIMITED.inc();
                tracing::warn!(client = %key, path = %path, "Rate limit exceeded");
                return Err(GatewayError::RateLimited);
            }
        }

        let upstream_path = route.upstream_path.as_deref().unwrap_or(path);
        self.forwarder
            .forward(&route.target, upstream_path, request, subject.as_deref())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthError;
    use crate::rate_limit::LimiterConfig;
    use std::time::Duration;

    struct RejectAll;

    impl CredentialVerifier for RejectAll {
        fn verify(&self, _authorization: &str) -> Result<String, AuthError> {
            Err(AuthError::InvalidSignature)
        }
    }

    fn dispatcher(routes: Vec<Route>) -> Dispatcher {
        Dispatcher::new(
            routes,
            Arc::new(RejectAll),
            Arc::new(RateLimiter::new(LimiterConfig::new(10.0, 20))),
            Forwarder::new(Duration::from_secs(1)).unwrap(),
        )
    }

    #[test]
    fn test_prefix_match_respects_segments() {
        let m = PathMatch::Prefix("/api/users".to_string());
        assert!(m.matches("/api/users"));
        assert!(m.matches("/api/users/list"));
        assert!(!m.matches("/api/usersx"));
        assert!(!m.matches("/api"));

        let m = PathMatch::Prefix("/api/auth/".to_string());
        assert!(m.matches("/api/auth/login"));
        assert!(m.matches("/api/auth/"));
        assert!(!m.matches("/api/auth"));
    }

    #[test]
    fn test_exact_match() {
        let m = PathMatch::Exact("/api/auth/health".to_string());
        assert!(m.matches("/api/auth/health"));
        assert!(!m.matches("/api/auth/health/"));
        assert!(!m.matches("/api/auth/healthz"));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let d = dispatcher(vec![
            Route::prefix("/api/", "http://fallback:9000"),
            Route::prefix("/api/users/", "http://users:8082").authenticated(),
            Route::exact("/api/users/health", "http://users:8082")
                .unlimited()
                .rewrite_to("/health"),
        ]);

        let route = d.resolve("/api/users/profile/7").unwrap();
        assert_eq!(route.target.upstream_base_url, "http://users:8082");
        assert!(route.policy.requires_auth);

        let route = d.resolve("/api/users/health").unwrap();
        assert_eq!(route.path, PathMatch::Exact("/api/users/health".to_string()));
        assert!(!route.policy.requires_auth);
        assert!(!route.policy.rate_limited);
        assert_eq!(route.upstream_path.as_deref(), Some("/health"));

        let route = d.resolve("/api/orders").unwrap();
        assert_eq!(route.target.upstream_base_url, "http://fallback:9000");

        assert!(d.resolve("/metrics-not-routed").is_none());
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        let d = dispatcher(vec![
            Route::prefix("/api/", "http://first:1"),
            Route::prefix("/api/", "http://second:2"),
        ]);
        assert_eq!(d.resolve("/api/x").unwrap().target.upstream_base_url, "http://first:1");
    }

    #[tokio::test]
    async fn test_unmatched_path_is_not_found() {
        let d = dispatcher(vec![Route::prefix("/api/auth/", "http://auth:8081")]);
        let request = axum::http::Request::builder().uri("/nope").body(axum::body::Body::empty()).unwrap();

        let err = d.dispatch(request, Some("127.0.0.1:5000")).await.unwrap_err();
        assert!(matches!(err, GatewayError::RouteNotFound));
    }

    #[tokio::test]
    async fn test_auth_failure_spends_no_token() {
        let d = dispatcher(vec![Route::prefix("/api/users/", "http://127.0.0.1:1").authenticated()]);
        let request = axum::http::Request::builder()
            .uri("/api/users/list")
            .header("authorization", "Bearer whatever")
            .body(axum::body::Body::empty())
            .unwrap();

        let err = d.dispatch(request, Some("10.0.0.9:5000")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Unauthorized(AuthError::InvalidSignature)));
        assert_eq!(d.limiter().bucket_count(), 0);
    }
}
