use std::sync::Arc;

use axum::{extract::Extension, Json};

use crate::app::dto::HealthResponse;
use crate::app::services::AppServices;

pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        queue: services.queue.clone(),
        transport: services.transport,
    })
}
