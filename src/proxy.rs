use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, HeaderName, HeaderValue, header},
    response::Response,
};
use std::error::Error as _;
use std::time::{Duration, Instant};

use crate::error::{GatewayError, GatewayResult};
use crate::metrics::{UPSTREAM_ERRORS, UPSTREAM_LATENCY};

pub const X_USER_ID: &str = "x-user-id";

// Connection-scoped headers; framing is renegotiated on each hop
const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::PROXY_AUTHENTICATE,
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name) || name == "keep-alive" || name == "proxy-connection"
}

// Upstream a route forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub upstream_base_url: String,
    pub path_prefix: String,
}

impl ProxyTarget {
    pub fn new(upstream_base_url: impl Into<String>, path_prefix: impl Into<String>) -> Self {
        Self {
            upstream_base_url: normalize_base_url(&upstream_base_url.into()),
            path_prefix: path_prefix.into(),
        }
    }

    // base + path (+ ?query)
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> String {
        let base = self.upstream_base_url.trim_end_matches('/');
        match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", base, path, q),
            _ => format!("{}{}", base, path),
        }
    }
}

// add http:// if not present
pub fn normalize_base_url(url: &str) -> String {
    let url = url.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

/// Executes a single upstream call per inbound request and streams the
/// upstream response back without buffering it.
///
/// No retries and no fallback: a transport failure becomes a 502. The same
/// timeout bounds the wait for response headers and every idle gap while the
/// body streams. Dropping the returned future (client went away) drops the
/// upstream call with it.
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            // idle limit per read, so a stalled body errors out while a flowing one never does
            .read_timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self::with_client(client, timeout))
    }

    pub fn with_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Forward `request` to `target`, sending it to `upstream_path` on the
    /// upstream. `subject`, when present, is asserted to the upstream as
    /// `X-User-Id`.
    pub async fn forward(
        &self,
        target: &ProxyTarget,
        upstream_path: &str,
        request: Request,
        subject: Option<&str>,
    ) -> GatewayResult<Response> {
        let (parts, body) = request.into_parts();
        let url = target.upstream_url(upstream_path, parts.uri.query());
        let url = reqwest::Url::parse(&url)
            .map_err(|e| GatewayError::Internal(format!("invalid upstream url {}: {}", url, e)))?;

        let headers = outbound_headers(&parts.headers, subject)?;
        let body = reqwest::Body::wrap_stream(body.into_data_stream());

        tracing::debug!(method = %parts.method, url = %url, "Forwarding request upstream");

        let start = Instant::now();
        let pending = self
            .client
            .request(parts.method.clone(), url.clone())
            .headers(headers)
            .body(body)
            .send();

        let upstream = match tokio::time::timeout(self.timeout, pending).await {
            Ok(Ok(res)) => res,
            Ok(Err(e)) => {
                UPSTREAM_ERRORS.inc();
                let err = classify(e);
                tracing::warn!(url = %url, error = %err, "Upstream request failed");
                return Err(err);
            }
            Err(_) => {
                UPSTREAM_ERRORS.inc();
                tracing::warn!(url = %url, timeout = ?self.timeout, "Upstream request timed out");
                return Err(GatewayError::UpstreamTimeout);
            }
        };
        UPSTREAM_LATENCY.observe(start.elapsed().as_secs_f64());

        tracing::debug!(url = %url, status = %upstream.status(), "Upstream responded");

        let status = upstream.status();
        let headers = inbound_headers(upstream.headers());
        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;

        Ok(response)
    }
}

// Headers sent upstream: every value of every name, minus Host and hop-by-hop
fn outbound_headers(inbound: &HeaderMap, subject: Option<&str>) -> GatewayResult<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 2);
    for (name, value) in inbound {
        if name == header::HOST || is_hop_by_hop(name) {
            continue;
        }
        if subject.is_some() && name == X_USER_ID {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }

    if let Some(subject) = subject {
        let value = HeaderValue::from_str(subject)
            .map_err(|e| GatewayError::Internal(format!("subject is not a valid header value: {}", e)))?;
        headers.insert(HeaderName::from_static(X_USER_ID), value);
    }

    Ok(headers)
}

// Headers returned to the caller: upstream's set verbatim, minus hop-by-hop
fn inbound_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

fn classify(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        return GatewayError::UpstreamTimeout;
    }

    // the inbound body stream failed, not the upstream
    let mut source = err.source();
    while let Some(inner) = source {
        if inner.downcast_ref::<axum::Error>().is_some() {
            return GatewayError::InboundBody(inner.to_string());
        }
        source = inner.source();
    }

    GatewayError::UpstreamUnreachable(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_url() {
        let target = ProxyTarget::new("http://user-service:8082/", "/api/users/");
        assert_eq!(
            target.upstream_url("/api/users/list", None),
            "http://user-service:8082/api/users/list"
        );
        assert_eq!(
            target.upstream_url("/api/users/list", Some("page=2&limit=10")),
            "http://user-service:8082/api/users/list?page=2&limit=10"
        );
        assert_eq!(target.upstream_url("/health", Some("")), "http://user-service:8082/health");
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("localhost:8081"), "http://localhost:8081");
        assert_eq!(normalize_base_url(" https://auth.example.com "), "https://auth.example.com");
    }

    #[test]
    fn test_outbound_headers_keep_duplicates_in_order() {
        let mut inbound = HeaderMap::new();
        inbound.append("x-trace", HeaderValue::from_static("a"));
        inbound.append("x-trace", HeaderValue::from_static("b"));
        inbound.append(header::HOST, HeaderValue::from_static("gateway:8080"));
        inbound.append(header::CONNECTION, HeaderValue::from_static("keep-alive"));

        let out = outbound_headers(&inbound, None).unwrap();
        let traces: Vec<&str> = out.get_all("x-trace").iter().map(|v| v.to_str().unwrap()).collect();
        assert_eq!(traces, vec!["a", "b"]);
        assert!(out.get(header::HOST).is_none());
        assert!(out.get(header::CONNECTION).is_none());
    }

    #[test]
    fn test_content_type_defaults_to_json() {
        let out = outbound_headers(&HeaderMap::new(), None).unwrap();
        assert_eq!(out.get(header::CONTENT_TYPE).unwrap(), "application/json");

        let mut inbound = HeaderMap::new();
        inbound.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let out = outbound_headers(&inbound, None).unwrap();
        assert_eq!(out.get_all(header::CONTENT_TYPE).iter().count(), 1);
        assert_eq!(out.get(header::CONTENT_TYPE).unwrap(), "text/plain");
    }

    #[test]
    fn test_subject_overwrites_inbound_user_id() {
        let mut inbound = HeaderMap::new();
        inbound.append(X_USER_ID, HeaderValue::from_static("spoofed"));

        let out = outbound_headers(&inbound, Some("user-42")).unwrap();
        let ids: Vec<&str> = out.get_all(X_USER_ID).iter().map(|v| v.to_str().unwrap()).collect();
        assert_eq!(ids, vec!["user-42"]);

        // untouched without a verified subject
        let out = outbound_headers(&inbound, None).unwrap();
        assert_eq!(out.get(X_USER_ID).unwrap(), "spoofed");
    }

    #[test]
    fn test_inbound_headers_copy_everything_but_framing() {
        let mut upstream = HeaderMap::new();
        upstream.append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
        upstream.append(header::SET_COOKIE, HeaderValue::from_static("b=2"));
        upstream.append(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        upstream.append("x-upstream", HeaderValue::from_static("yes"));

        let out = inbound_headers(&upstream);
        assert_eq!(out.get_all(header::SET_COOKIE).iter().count(), 2);
        assert_eq!(out.get("x-upstream").unwrap(), "yes");
        assert!(out.get(header::TRANSFER_ENCODING).is_none());
    }
}
