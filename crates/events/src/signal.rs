//! Operational signals published by the queue and the workflow engine.
//!
//! Signals are informational: the stores remain the source of truth, and a
//! lost signal never changes what happened to a job or an instance.

use serde::{Deserialize, Serialize};

use taskpulse_core::{InstanceId, JobId, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineSignal {
    /// A job handler succeeded.
    JobCompleted { queue: String, job_id: JobId },
    /// A job exhausted its attempts (or failed permanently) and will not be
    /// retried again.
    JobDeadLettered {
        queue: String,
        job_id: JobId,
        attempts: u32,
        reason: String,
    },
    /// A workflow instance reached `Completed`.
    InstanceCompleted {
        instance_id: InstanceId,
        task_id: TaskId,
        reminded: bool,
    },
    /// A workflow instance was cancelled (task removed).
    InstanceCancelled {
        instance_id: InstanceId,
        task_id: TaskId,
        reason: String,
    },
}
