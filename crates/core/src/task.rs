//! The task view the notification pipeline reads from the task service.
//!
//! The pipeline never owns tasks. It only reads a denormalised snapshot
//! (task + project name + assignee contact) from the source of truth, and it
//! re-reads it at every workflow step.

use core::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::TaskId;

/// Workflow status of a task as stored by the task service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "TODO",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Done => "DONE",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, TaskStatus::Done)
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DomainError;

    /// Accepts the upstream spelling case-insensitively (`"done"`, `"DONE"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TODO" => Ok(TaskStatus::Todo),
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            "DONE" => Ok(TaskStatus::Done),
            other => Err(DomainError::validation(format!("unknown task status: {other}"))),
        }
    }
}

/// The person a task is assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignee {
    pub name: String,
    pub email: String,
}

/// Project the task belongs to (only the name is needed for rendering).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
    pub name: String,
}

/// Denormalised task view: `{title, description, due_date, project.name,
/// assignee.name, assignee.email}` plus identity and status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    pub due_date: Option<DateTime<Utc>>,
    pub project: ProjectRef,
    pub assignee: Option<Assignee>,
}

impl TaskSnapshot {
    /// Recipient address, if the task has an assignee.
    pub fn recipient(&self) -> Option<&str> {
        self.assignee.as_ref().map(|a| a.email.as_str())
    }

    /// Due date as a calendar date in the given local offset.
    pub fn local_due_date(&self, offset: FixedOffset) -> Option<NaiveDate> {
        self.due_date.map(|d| local_date(d, offset))
    }

    /// Whether the task is due on the same local calendar day as `now`.
    ///
    /// Compares dates, not timestamps: a task due at 23:00 is "due today" at
    /// 08:00 the same day.
    pub fn is_due_on_day_of(&self, now: DateTime<Utc>, offset: FixedOffset) -> bool {
        self.local_due_date(offset) == Some(local_date(now, offset))
    }
}

/// Calendar date of `ts` in the given offset.
pub fn local_date(ts: DateTime<Utc>, offset: FixedOffset) -> NaiveDate {
    ts.with_timezone(&offset).date_naive()
}
