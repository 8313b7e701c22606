//! Request tracing middleware
//!
//! Every request gets an id (taken from `X-Request-ID` or generated), a
//! span carrying it, start and completion log lines, and an entry in the
//! per-endpoint metrics. The id is echoed back in the response headers.

use axum::{
    body::Body,
    extract::{ConnectInfo, MatchedPath},
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::common::metrics::METRICS;

/// Header name for request ID
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
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
        .map(|s| s.to_string())
        .unwrap_or_else(generate_request_id);

    let method = request.method().clone();
    // Route template, so `/rides/17` and `/rides/18` share one metrics entry
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let path = request.uri().path().to_string();
    let client_ip = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "-".to_string());

    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %method,
        path = %path,
        client_ip = %client_ip,
    );

    let mut response = async move {
        info!("Request started");
        next.run(request).await
    }
    .instrument(span.clone())
    .await;

    let duration = start.elapsed();
    let status = response.status();
    METRICS.record_request(&route, duration, !status.is_server_error());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let _guard = span.enter();
    let duration_ms = duration.as_millis() as u64;
    if status.is_success() {
        info!(status = status.as_u16(), duration_ms, "Request completed");
    } else if status.is_client_error() {
        warn!(status = status.as_u16(), duration_ms, "Client error");
    } else {
        warn!(status = status.as_u16(), duration_ms, "Server error");
    }

    response
}
