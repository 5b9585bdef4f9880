use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::auth::AuthError;

pub const RATE_LIMIT_BODY: &str = "rate limit exceeded";

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Every way a proxied request can end without reaching (or hearing back
/// from) its upstream. All variants are terminal for the request.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("no route for path")]
    RouteNotFound,

    #[error("failed to read request body: {0}")]
    InboundBody(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UpstreamUnreachable(_) | GatewayError::UpstreamTimeout => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::RouteNotFound => StatusCode::NOT_FOUND,
            GatewayError::InboundBody(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    // Caller-facing message; transport details stay in the logs
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::Unauthorized(auth) => auth.to_string(),
            GatewayError::RateLimited => RATE_LIMIT_BODY.to_string(),
            GatewayError::UpstreamUnreachable(_) | GatewayError::UpstreamTimeout => {
                "Bad Gateway".to_string()
            }
            GatewayError::RouteNotFound => "Not Found".to_string(),
            GatewayError::InboundBody(_) | GatewayError::Internal(_) => {
                "Internal Server Error".to_string()
            }
        }
    }

    // Short label for metrics
    pub fn outcome(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::RateLimited => "rate_limited",
            GatewayError::UpstreamUnreachable(_) => "upstream_unreachable",
            GatewayError::UpstreamTimeout => "upstream_timeout",
            GatewayError::RouteNotFound => "not_found",
            GatewayError::InboundBody(_) => "inbound_body",
            GatewayError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // 429 is plain text; everything produced locally is JSON
        if let GatewayError::RateLimited = self {
            return (
                status,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                RATE_LIMIT_BODY,
            )
                .into_response();
        }

        (status, Json(json!({ "error": self.user_message() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_rate_limited_is_plain_text() {
        let response = GatewayError::RateLimited.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_string(response).await, "rate limit exceeded");
    }

    #[tokio::test]
    async fn test_upstream_failures_hide_details() {
        let response =
            GatewayError::UpstreamUnreachable("dns error: user-service.internal".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body, json!({ "error": "Bad Gateway" }));

        let response = GatewayError::UpstreamTimeout.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_auth_errors_are_401_json() {
        for (err, message) in [
            (AuthError::MalformedCredential, "malformed credential"),
            (AuthError::InvalidSignature, "invalid signature"),
            (AuthError::Expired, "token expired"),
            (AuthError::NotYetValid, "token not yet valid"),
        ] {
            let response = GatewayError::from(err).into_response();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

            let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
            assert_eq!(body, json!({ "error": message }));
        }
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(GatewayError::RouteNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            GatewayError::InboundBody("reset".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::Internal("bad uri".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
