use std::time::Instant;

use axum::{http::Request, middleware::Next, response::Response};
use tracing::{info, warn};

/// Log one line per request with method, path, status and latency.
pub async fn trace_requests(req: Request<axum::body::Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;

    let status = response.status();
    let latency_ms = started.elapsed().as_millis() as u64;
    if status.is_server_error() {
        warn!(%method, %path, status = status.as_u16(), latency_ms, "request failed");
    } else {
        info!(%method, %path, status = status.as_u16(), latency_ms, "request handled");
    }
    response
}
