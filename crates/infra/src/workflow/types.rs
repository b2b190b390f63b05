//! Workflow instance model.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskpulse_core::{InstanceId, TaskId};

use crate::jobs::types::to_chrono;

/// Step names, stable across releases: they key the persisted memo.
pub mod steps {
    pub const SEND_ASSIGNMENT: &str = "send-assignment";
    pub const WAIT_FOR_DUE_DATE: &str = "wait-for-due-date";
    pub const CHECK_AND_REMIND: &str = "check-and-remind";
    pub const SEND_REMINDER: &str = "send-reminder";
}

/// `Running → Sleeping → Running → Completed`, `Running → Completed` when the
/// task is due today, `Running | Sleeping → Cancelled` when it is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Running,
    Sleeping,
    Completed,
    Cancelled,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Completed | InstanceState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Running => "running",
            InstanceState::Sleeping => "sleeping",
            InstanceState::Completed => "completed",
            InstanceState::Cancelled => "cancelled",
        }
    }
}

impl core::str::FromStr for InstanceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(InstanceState::Running),
            "sleeping" => Ok(InstanceState::Sleeping),
            "completed" => Ok(InstanceState::Completed),
            "cancelled" => Ok(InstanceState::Cancelled),
            other => Err(format!("unknown instance state: {other}")),
        }
    }
}

impl core::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recorded outcome of a step. Write-once per `(instance, step)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMemo {
    pub step: String,
    pub completed: bool,
    pub result: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl StepMemo {
    pub fn completed(step: &str, result: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            step: step.to_string(),
            completed: true,
            result,
            recorded_at: now,
        }
    }
}

/// One task's notification workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub task_id: TaskId,
    /// Link target for the "View Task" button
    pub origin: String,
    pub state: InstanceState,
    /// Single pending wake; only ever moves forward
    pub wake_at: Option<DateTime<Utc>>,
    pub memo: BTreeMap<String, StepMemo>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl WorkflowInstance {
    /// A new running instance, leased to its creator so it can be driven
    /// straight away.
    pub fn new(
        task_id: TaskId,
        origin: impl Into<String>,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: InstanceId::new(),
            task_id,
            origin: origin.into(),
            state: InstanceState::Running,
            wake_at: None,
            memo: BTreeMap::new(),
            lease_owner: Some(owner.to_string()),
            lease_expires_at: Some(now + to_chrono(lease)),
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepMemo> {
        self.memo.get(name).filter(|m| m.completed)
    }

    pub fn is_step_done(&self, name: &str) -> bool {
        self.step(name).is_some()
    }

    /// Whether a scanner may lease this instance at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        let lease_free = self.lease_expires_at.map_or(true, |at| at < now);
        match self.state {
            InstanceState::Sleeping => lease_free && self.wake_at.is_some_and(|at| at <= now),
            InstanceState::Running => lease_free,
            InstanceState::Completed | InstanceState::Cancelled => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_instance_is_leased_to_creator() {
        let now = Utc::now();
        let inst = WorkflowInstance::new(TaskId::new(), "https://app", "engine-1", Duration::from_secs(60), now);

        assert_eq!(inst.state, InstanceState::Running);
        assert_eq!(inst.lease_owner.as_deref(), Some("engine-1"));
        assert!(!inst.is_due(now));
        assert!(inst.is_due(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn sleeping_instance_is_due_at_wake_time() {
        let now = Utc::now();
        let mut inst = WorkflowInstance::new(TaskId::new(), "", "e", Duration::from_secs(60), now);
        inst.state = InstanceState::Sleeping;
        inst.lease_owner = None;
        inst.lease_expires_at = None;
        inst.wake_at = Some(now + chrono::Duration::hours(24));

        assert!(!inst.is_due(now + chrono::Duration::hours(23)));
        assert!(inst.is_due(now + chrono::Duration::hours(24)));
    }

    #[test]
    fn incomplete_memo_does_not_count() {
        let now = Utc::now();
        let mut inst = WorkflowInstance::new(TaskId::new(), "", "e", Duration::from_secs(60), now);
        inst.memo.insert(
            steps::SEND_ASSIGNMENT.to_string(),
            StepMemo {
                completed: false,
                ..StepMemo::completed(steps::SEND_ASSIGNMENT, serde_json::Value::Null, now)
            },
        );
        assert!(!inst.is_step_done(steps::SEND_ASSIGNMENT));
    }
}
