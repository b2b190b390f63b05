//! Producer events emitted by the task service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskpulse_core::TaskId;

/// Emitted once per task creation when the task has an assignee.
///
/// `origin` is the request origin of the creating client; notification links
/// point back to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssigned {
    pub task_id: TaskId,
    #[serde(default)]
    pub origin: String,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

impl TaskAssigned {
    pub fn new(task_id: TaskId, origin: impl Into<String>) -> Self {
        Self {
            task_id,
            origin: origin.into(),
            occurred_at: Utc::now(),
        }
    }
}

/// Emitted when tasks are removed, one event per delete request; live
/// workflow instances of every listed task are cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDeleted {
    pub task_ids: Vec<TaskId>,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}
