use axum::{http::StatusCode, response::IntoResponse};

pub async fn metrics_handler() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}
