//! HTTP API: configuration, service wiring, and the inspection/ingress router.

pub mod app;
pub mod config;
pub mod middleware;
