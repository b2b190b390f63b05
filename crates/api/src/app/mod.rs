//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: stores, transport, executor and scanner wiring
//! - `routes/`: HTTP handlers (inspection and ingress)
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs` and the
/// black-box tests).
pub fn build_app(services: Arc<services::AppServices>) -> Router {
    routes::router().layer(
        ServiceBuilder::new()
            .layer(axum::middleware::from_fn(middleware::trace_requests))
            .layer(Extension(services)),
    )
}
