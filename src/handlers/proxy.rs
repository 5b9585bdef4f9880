use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::state::AppState;

// Fallback handler - every path not served locally goes through the dispatcher
pub async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request) -> Response {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string());

    match state.dispatcher.dispatch(request, remote_addr.as_deref()).await {
        Ok(response) => response,
        Err(e) => {
            if e.status_code() == StatusCode::INTERNAL_SERVER_ERROR {
                tracing::error!(error = %e, "Request failed inside the gateway");
            }
            e.into_response()
        }
    }
}
