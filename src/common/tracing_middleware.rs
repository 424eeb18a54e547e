//! Request tracing middleware for the HTTP control plane
//!
//! Every request gets an `X-Request-ID` (propagated from the caller when
//! present) and a span tagged with the API group it hits. Completion is logged
//! by outcome: expected control-plane rejections (422) are routine, 5xx are
//! errors, and health probes stay at debug level.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderValue, Request, Response, StatusCode},
    middleware::Next,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

/// Header name for request ID
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Generate a new unique request ID
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// API group of a request path, used as a span field.
pub fn route_group(path: &str) -> &'static str {
    let first = path.trim_start_matches('/').split('/').next().unwrap_or("");
    match first {
        "db" => "kv",
        "raft" => "membership",
        "health" => "health",
        "admin" => "admin",
        _ => "other",
    }
}

pub async fn request_tracing_middleware(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let start = Instant::now();

    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let group = route_group(&path);
    let peer = connect_info
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "-".to_string());

    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %method,
        path = %path,
        group,
        peer = %peer,
    );

    let mut response = next.run(request).instrument(span.clone()).await;
    let status = response.status();
    let duration_ms = start.elapsed().as_millis() as u64;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let _guard = span.enter();
    match status {
        s if group == "health" && s.is_success() => {
            tracing::debug!(status = s.as_u16(), duration_ms, "Health probe")
        }
        s if s.is_success() => tracing::info!(status = s.as_u16(), duration_ms, "Request completed"),
        StatusCode::UNPROCESSABLE_ENTITY => {
            tracing::info!(status = 422u16, duration_ms, "Request rejected")
        }
        s if s.is_server_error() => {
            tracing::error!(status = s.as_u16(), duration_ms, "Request failed")
        }
        s => tracing::warn!(status = s.as_u16(), duration_ms, "Request failed"),
    }

    response
}
