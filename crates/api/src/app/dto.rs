//! Request/response DTOs for the inspection and ingress routes.

use serde::{Deserialize, Serialize};

use taskpulse_core::{InstanceId, JobId};
use taskpulse_infra::jobs::{Job, QueueStats};
use taskpulse_infra::workflow::WorkflowInstance;

pub const DEFAULT_PAGE: usize = 50;
pub const MAX_PAGE: usize = 500;

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<String>,
    pub limit: Option<usize>,
}

impl ListJobsQuery {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
    }
}

#[derive(Debug, Deserialize)]
pub struct WorkflowsQuery {
    pub task_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub queue: String,
    pub transport: &'static str,
}

#[derive(Debug, Serialize)]
pub struct QueueStatsResponse {
    pub queue: String,
    pub depth: usize,
    #[serde(flatten)]
    pub stats: QueueStats,
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub queue: String,
    pub jobs: Vec<Job>,
}

#[derive(Debug, Serialize)]
pub struct WorkflowListResponse {
    pub instances: Vec<WorkflowInstance>,
}

#[derive(Debug, Serialize)]
pub struct TaskAssignedResponse {
    pub accepted: bool,
    pub job_id: Option<JobId>,
    pub instance_id: Option<InstanceId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct TaskDeletedResponse {
    pub cancelled: Vec<InstanceId>,
}
