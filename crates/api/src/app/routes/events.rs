//! Ingress for the task service: one call per task creation or deletion.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use tracing::warn;

use taskpulse_events::{TaskAssigned, TaskDeleted};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/task-assigned", post(task_assigned))
        .route("/task-deleted", post(task_deleted))
}

/// Accepted (202) once the job and the workflow instance are stored, even if
/// one half failed to start; those failures are operational and listed in
/// the response. No mail is sent before the response.
pub async fn task_assigned(
    Extension(services): Extension<Arc<AppServices>>,
    Json(event): Json<TaskAssigned>,
) -> axum::response::Response {
    match services
        .pipeline
        .on_task_assigned(event.task_id, &event.origin, Utc::now())
        .await
    {
        Ok(receipt) => {
            if !receipt.errors.is_empty() {
                warn!(task_id = %event.task_id, errors = ?receipt.errors, "task assignment partially handled");
            }
            (
                StatusCode::ACCEPTED,
                Json(dto::TaskAssignedResponse {
                    accepted: true,
                    job_id: receipt.job_id,
                    instance_id: receipt.instance_id,
                    errors: receipt.errors,
                }),
            )
                .into_response()
        }
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn task_deleted(
    Extension(services): Extension<Arc<AppServices>>,
    Json(event): Json<TaskDeleted>,
) -> axum::response::Response {
    match services.pipeline.on_task_deleted(&event.task_ids, Utc::now()).await {
        Ok(cancelled) => (StatusCode::ACCEPTED, Json(dto::TaskDeletedResponse { cancelled })).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
