use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use taskpulse_infra::PipelineError;
use taskpulse_infra::jobs::JobStoreError;
use taskpulse_infra::workflow::{WorkflowError, WorkflowStoreError};

pub fn job_store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        JobStoreError::AlreadyExists(_) | JobStoreError::LeaseLost(_) => {
            json_error(StatusCode::CONFLICT, "conflict", err.to_string())
        }
        JobStoreError::Storage(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "store_error", msg),
    }
}

pub fn workflow_store_error_to_response(err: WorkflowStoreError) -> axum::response::Response {
    match err {
        WorkflowStoreError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("workflow instance {id} not found"))
        }
        WorkflowStoreError::AlreadyExists(_) | WorkflowStoreError::LeaseLost(_) => {
            json_error(StatusCode::CONFLICT, "conflict", err.to_string())
        }
        WorkflowStoreError::Storage(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "store_error", msg),
    }
}

pub fn pipeline_error_to_response(err: PipelineError) -> axum::response::Response {
    match err {
        PipelineError::TaskNotFound(_) => json_error(StatusCode::NOT_FOUND, "task_not_found", err.to_string()),
        PipelineError::NoAssignee(_) => json_error(StatusCode::UNPROCESSABLE_ENTITY, "no_assignee", err.to_string()),
        PipelineError::TaskSource(e) => json_error(StatusCode::SERVICE_UNAVAILABLE, "task_source_error", e.to_string()),
        PipelineError::Queue(e) => job_store_error_to_response(e),
        PipelineError::Workflow(WorkflowError::Store(e)) => workflow_store_error_to_response(e),
        PipelineError::Workflow(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "workflow_error", e.to_string()),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Parse a path/query identifier, answering 400 on garbage.
pub fn parse_id<T>(raw: &str, what: &'static str) -> Result<T, axum::response::Response>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    raw.parse()
        .map_err(|e: T::Err| json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("invalid {what}: {e}")))
}
