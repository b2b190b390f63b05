//! Read access to the task service's records (the source of truth).

pub mod postgres;

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use taskpulse_core::{TaskId, TaskSnapshot, TaskStatus};

pub use postgres::PostgresTaskSource;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskSourceError {
    #[error("task source unavailable: {0}")]
    Unavailable(String),
    #[error("invalid task record {0}: {1}")]
    InvalidRecord(TaskId, String),
}

/// Fetches the current view of a task. `Ok(None)` means the task is gone.
#[async_trait]
pub trait TaskSource: Send + Sync {
    async fn fetch(&self, task_id: TaskId) -> Result<Option<TaskSnapshot>, TaskSourceError>;
}

/// Map-backed source for tests and single-process demos.
#[derive(Debug, Default)]
pub struct InMemoryTaskSource {
    tasks: RwLock<HashMap<TaskId, TaskSnapshot>>,
}

impl InMemoryTaskSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, task: TaskSnapshot) {
        self.write().insert(task.id, task);
    }

    pub fn set_status(&self, task_id: TaskId, status: TaskStatus) -> bool {
        match self.write().get_mut(&task_id) {
            Some(task) => {
                task.status = status;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, task_id: TaskId) -> Option<TaskSnapshot> {
        self.write().remove(&task_id)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TaskId, TaskSnapshot>> {
        self.tasks.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl TaskSource for InMemoryTaskSource {
    async fn fetch(&self, task_id: TaskId) -> Result<Option<TaskSnapshot>, TaskSourceError> {
        let tasks = self
            .tasks
            .read()
            .map_err(|_| TaskSourceError::Unavailable("task map lock poisoned".to_string()))?;
        Ok(tasks.get(&task_id).cloned())
    }
}
