use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use taskpulse_core::{InstanceId, TaskId};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub async fn get_instance(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let instance_id: InstanceId = match errors::parse_id(&id, "instance id") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.workflows.get(instance_id).await {
        Ok(Some(instance)) => Json(instance).into_response(),
        Ok(None) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("workflow instance {instance_id} not found"),
        ),
        Err(e) => errors::workflow_store_error_to_response(e),
    }
}

/// `GET /workflows?task_id=`; the filter is required.
pub async fn list_instances(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::WorkflowsQuery>,
) -> axum::response::Response {
    let Some(raw) = query.task_id else {
        return errors::json_error(StatusCode::BAD_REQUEST, "missing_task_id", "task_id query parameter is required");
    };
    let task_id: TaskId = match errors::parse_id(&raw, "task id") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.workflows.find_by_task(task_id).await {
        Ok(instances) => Json(dto::WorkflowListResponse { instances }).into_response(),
        Err(e) => errors::workflow_store_error_to_response(e),
    }
}
