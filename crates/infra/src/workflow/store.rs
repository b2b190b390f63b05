//! Workflow instance persistence.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use taskpulse_core::{InstanceId, TaskId};

use super::types::{InstanceState, StepMemo, WorkflowInstance};
use crate::jobs::types::to_chrono;

#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkflowStoreError {
    #[error("workflow instance not found: {0}")]
    NotFound(InstanceId),
    #[error("workflow instance already exists: {0}")]
    AlreadyExists(InstanceId),
    #[error("lease lost for workflow instance {0}")]
    LeaseLost(InstanceId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Instance store.
///
/// Mutating calls that take an `owner` are compare-and-set on the lease: they
/// only apply while `owner` holds a live lease (`lease_expires_at >= now`) on
/// a running instance, and return `LeaseLost` otherwise.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persist a new instance (already leased to its creator).
    async fn create(&self, instance: WorkflowInstance) -> Result<(), WorkflowStoreError>;

    /// Load an instance with its step memo.
    async fn get(&self, id: InstanceId) -> Result<Option<WorkflowInstance>, WorkflowStoreError>;

    /// All instances for a task, oldest first.
    async fn find_by_task(&self, task_id: TaskId) -> Result<Vec<WorkflowInstance>, WorkflowStoreError>;

    /// Lease a due instance (see [`WorkflowInstance::is_due`]) and mark it
    /// `Running`. Returns `None` when it is not due, leased elsewhere, or
    /// finished.
    async fn try_lease(
        &self,
        id: InstanceId,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowInstance>, WorkflowStoreError>;

    /// Write-once memo insert, under `owner`'s lease. Returns `false` if the
    /// step was already recorded; the existing entry is left untouched.
    async fn record_step(
        &self,
        id: InstanceId,
        owner: &str,
        memo: StepMemo,
        now: DateTime<Utc>,
    ) -> Result<bool, WorkflowStoreError>;

    /// Suspend the instance: `Sleeping`, lease released, `wake_at` moved to
    /// `max(current, wake_at)`. Returns the effective wake time.
    async fn sleep_until(
        &self,
        id: InstanceId,
        owner: &str,
        wake_at: DateTime<Utc>,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, WorkflowStoreError>;

    /// Finish the instance.
    async fn complete(&self, id: InstanceId, owner: &str, now: DateTime<Utc>) -> Result<(), WorkflowStoreError>;

    /// `Running | Sleeping → Cancelled`, regardless of lease. Returns `false`
    /// when the instance had already finished.
    async fn cancel(&self, id: InstanceId, reason: &str, now: DateTime<Utc>) -> Result<bool, WorkflowStoreError>;

    /// Instances a scanner should resume at `now`, earliest first.
    async fn due_for_wake(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<InstanceId>, WorkflowStoreError>;
}

/// In-memory instance store for tests/dev. Not durable across restarts.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowStore {
    instances: RwLock<HashMap<InstanceId, WorkflowInstance>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<InstanceId, WorkflowInstance>>, WorkflowStoreError> {
        self.instances
            .write()
            .map_err(|_| WorkflowStoreError::Storage("workflow store lock poisoned".to_string()))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<InstanceId, WorkflowInstance>>, WorkflowStoreError> {
        self.instances
            .read()
            .map_err(|_| WorkflowStoreError::Storage("workflow store lock poisoned".to_string()))
    }
}

/// The instance `owner` still holds a live lease on, or `LeaseLost`.
fn owned<'a>(
    instances: &'a mut HashMap<InstanceId, WorkflowInstance>,
    id: InstanceId,
    owner: &str,
    now: DateTime<Utc>,
) -> Result<&'a mut WorkflowInstance, WorkflowStoreError> {
    let inst = instances.get_mut(&id).ok_or(WorkflowStoreError::NotFound(id))?;
    let live = inst.lease_expires_at.is_some_and(|expires| expires >= now);
    if inst.state != InstanceState::Running || inst.lease_owner.as_deref() != Some(owner) || !live {
        return Err(WorkflowStoreError::LeaseLost(id));
    }
    Ok(inst)
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create(&self, instance: WorkflowInstance) -> Result<(), WorkflowStoreError> {
        let mut instances = self.write()?;
        if instances.contains_key(&instance.id) {
            return Err(WorkflowStoreError::AlreadyExists(instance.id));
        }
        instances.insert(instance.id, instance);
        Ok(())
    }

    async fn get(&self, id: InstanceId) -> Result<Option<WorkflowInstance>, WorkflowStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn find_by_task(&self, task_id: TaskId) -> Result<Vec<WorkflowInstance>, WorkflowStoreError> {
        let mut found: Vec<_> = self
            .read()?
            .values()
            .filter(|i| i.task_id == task_id)
            .cloned()
            .collect();
        found.sort_by_key(|i| (i.created_at, *i.id.as_uuid()));
        Ok(found)
    }

    async fn try_lease(
        &self,
        id: InstanceId,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowInstance>, WorkflowStoreError> {
        let mut instances = self.write()?;
        let Some(inst) = instances.get_mut(&id) else {
            return Ok(None);
        };
        if !inst.is_due(now) {
            return Ok(None);
        }

        inst.state = InstanceState::Running;
        inst.lease_owner = Some(owner.to_string());
        inst.lease_expires_at = Some(now + to_chrono(lease));
        inst.updated_at = now;
        Ok(Some(inst.clone()))
    }

    async fn record_step(
        &self,
        id: InstanceId,
        owner: &str,
        memo: StepMemo,
        now: DateTime<Utc>,
    ) -> Result<bool, WorkflowStoreError> {
        let mut instances = self.write()?;
        let inst = owned(&mut instances, id, owner, now)?;
        if inst.memo.contains_key(&memo.step) {
            return Ok(false);
        }
        inst.memo.insert(memo.step.clone(), memo);
        Ok(true)
    }

    async fn sleep_until(
        &self,
        id: InstanceId,
        owner: &str,
        wake_at: DateTime<Utc>,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, WorkflowStoreError> {
        let mut instances = self.write()?;
        let inst = owned(&mut instances, id, owner, now)?;

        let effective = inst.wake_at.map_or(wake_at, |current| current.max(wake_at));
        inst.state = InstanceState::Sleeping;
        inst.wake_at = Some(effective);
        inst.lease_owner = None;
        inst.lease_expires_at = None;
        inst.last_error = last_error;
        inst.updated_at = now;
        Ok(effective)
    }

    async fn complete(&self, id: InstanceId, owner: &str, now: DateTime<Utc>) -> Result<(), WorkflowStoreError> {
        let mut instances = self.write()?;
        let inst = owned(&mut instances, id, owner, now)?;

        inst.state = InstanceState::Completed;
        inst.lease_owner = None;
        inst.lease_expires_at = None;
        inst.last_error = None;
        inst.updated_at = now;
        Ok(())
    }

    async fn cancel(&self, id: InstanceId, reason: &str, now: DateTime<Utc>) -> Result<bool, WorkflowStoreError> {
        let mut instances = self.write()?;
        let inst = instances.get_mut(&id).ok_or(WorkflowStoreError::NotFound(id))?;
        if inst.state.is_terminal() {
            return Ok(false);
        }

        inst.state = InstanceState::Cancelled;
        inst.lease_owner = None;
        inst.lease_expires_at = None;
        inst.last_error = Some(reason.to_string());
        inst.updated_at = now;
        Ok(true)
    }

    async fn due_for_wake(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<InstanceId>, WorkflowStoreError> {
        let instances = self.read()?;
        let mut due: Vec<_> = instances
            .values()
            .filter(|i| i.is_due(now))
            .map(|i| (i.wake_at.unwrap_or(i.updated_at), i.id))
            .collect();
        due.sort_by_key(|(at, id)| (*at, *id.as_uuid()));
        Ok(due.into_iter().take(limit).map(|(_, id)| id).collect())
    }
}
