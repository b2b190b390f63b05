use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use taskpulse_core::JobId;
use taskpulse_infra::jobs::JobState;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub async fn stats(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
) -> axum::response::Response {
    match services.jobs.stats(&queue).await {
        Ok(stats) => Json(dto::QueueStatsResponse {
            depth: stats.depth(),
            queue,
            stats,
        })
        .into_response(),
        Err(e) => errors::job_store_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let state = match query.state.as_deref().map(str::parse::<JobState>).transpose() {
        Ok(state) => state,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_state", msg),
    };

    match services.jobs.list(&queue, state, query.limit()).await {
        Ok(jobs) => Json(dto::JobListResponse { queue, jobs }).into_response(),
        Err(e) => errors::job_store_error_to_response(e),
    }
}

pub async fn dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Path(queue): Path<String>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    match services
        .jobs
        .list(&queue, Some(JobState::DeadLettered), query.limit())
        .await
    {
        Ok(jobs) => Json(dto::JobListResponse { queue, jobs }).into_response(),
        Err(e) => errors::job_store_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match errors::parse_id(&id, "job id") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.jobs.get(job_id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {job_id} not found")),
        Err(e) => errors::job_store_error_to_response(e),
    }
}
