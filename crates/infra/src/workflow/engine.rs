//! Durable workflow engine for the per-task notification process.
//!
//! An instance is driven in short bursts. Each burst leases the instance,
//! replays its step memo, runs the first step that has no memo entry, and
//! either suspends (`Sleeping` with a `wake_at`) or finishes. Between bursts
//! an instance is only a row in the store.
//!
//! ```text
//! send-assignment ──► due today / no due date ──────────────────► Completed
//!        │
//!        └──► wait-for-due-date (Sleeping) ──► check-and-remind ──► Completed
//!                                                   │
//!                                                   └─ not DONE ─► send-reminder
//! ```
//!
//! Side-effecting steps are memoised the moment they succeed, so a replayed
//! burst never repeats a send that was recorded.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use taskpulse_core::{InstanceId, TaskId, TaskSnapshot};
use taskpulse_events::PipelineSignal;

use super::store::{WorkflowStore, WorkflowStoreError};
use super::types::{InstanceState, StepMemo, WorkflowInstance, steps};
use crate::jobs::types::to_chrono;
use crate::notify::{Dispatcher, MessageId, TransportError};
use crate::signals::{SignalBus, emit};
use crate::tasks::TaskSource;

/// Slack on top of the dispatcher timeout when the configured lease is too
/// short to cover one send.
const LEASE_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Lease owner name for this engine
    pub owner: String,
    /// Lease held while a burst runs; must outlast one dispatcher send
    pub lease: Duration,
    /// Delay before a failed step is tried again
    pub step_retry_delay: Duration,
    /// Calendar used for the "due today" comparison
    pub due_date_offset: FixedOffset,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            owner: format!("engine-{}", std::process::id()),
            lease: Duration::from_secs(60),
            step_retry_delay: Duration::from_secs(300),
            due_date_offset: Utc.fix(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkflowError {
    /// A step body failed; the instance retries it on a later wake.
    #[error("step {step} failed: {message}")]
    Step { step: &'static str, message: String },
    /// The task (or its assignee) is gone; the instance is cancelled.
    #[error("task {0} no longer exists")]
    RecordNotFound(TaskId),
    #[error(transparent)]
    Store(#[from] WorkflowStoreError),
}

/// What a `create_instance` / `resume` burst did.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// Not due, leased elsewhere, or already finished. Nothing ran.
    Skipped,
    Sleeping { wake_at: DateTime<Utc> },
    /// A step failed; it will be retried at `wake_at`.
    RetryScheduled { wake_at: DateTime<Utc>, error: String },
    Completed { reminded: bool },
    Cancelled { reason: String },
}

enum Progress {
    Sleep(DateTime<Utc>),
    Done { reminded: bool },
}

#[derive(Clone)]
pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    tasks: Arc<dyn TaskSource>,
    dispatcher: Dispatcher,
    signals: Option<SignalBus>,
    config: WorkflowConfig,
}

impl WorkflowEngine {
    /// A lease that does not outlast the dispatcher timeout is raised to
    /// `timeout + 30s`, so a slow send cannot be taken over mid-flight.
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        tasks: Arc<dyn TaskSource>,
        dispatcher: Dispatcher,
        mut config: WorkflowConfig,
    ) -> Self {
        if config.lease <= dispatcher.timeout() {
            let lease = dispatcher.timeout() + LEASE_MARGIN;
            warn!(
                configured_ms = config.lease.as_millis() as u64,
                lease_ms = lease.as_millis() as u64,
                "workflow lease shorter than the dispatcher timeout; raising it"
            );
            config.lease = lease;
        }

        Self {
            store,
            tasks,
            dispatcher,
            signals: None,
            config,
        }
    }

    pub fn with_signals(mut self, bus: SignalBus) -> Self {
        self.signals = Some(bus);
        self
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn lease(&self) -> Duration {
        self.config.lease
    }

    /// Persist a new instance for `task_id` and run its first burst.
    pub async fn create_instance(
        &self,
        task_id: TaskId,
        origin: &str,
        now: DateTime<Utc>,
    ) -> Result<(InstanceId, ResumeOutcome), WorkflowError> {
        let instance = self.persist(task_id, origin, now).await?;
        let id = instance.id;
        let outcome = self.drive(instance, now).await?;
        Ok((id, outcome))
    }

    /// Persist a new instance and return once it is stored; the first burst
    /// runs on a spawned task.
    ///
    /// If that burst dies with the process, the instance stays `Running` under
    /// this engine's lease and a wake scanner takes it over after expiry.
    pub async fn start_instance(
        &self,
        task_id: TaskId,
        origin: &str,
        now: DateTime<Utc>,
    ) -> Result<InstanceId, WorkflowError> {
        let instance = self.persist(task_id, origin, now).await?;
        let id = instance.id;

        let engine = self.clone();
        tokio::spawn(async move {
            match engine.drive(instance, now).await {
                Ok(outcome) => debug!(instance_id = %id, ?outcome, "first burst finished"),
                Err(e) => warn!(instance_id = %id, error = %e, "first burst failed; left to the wake scanner"),
            }
        });
        Ok(id)
    }

    async fn persist(&self, task_id: TaskId, origin: &str, now: DateTime<Utc>) -> Result<WorkflowInstance, WorkflowError> {
        let instance = WorkflowInstance::new(task_id, origin, &self.config.owner, self.config.lease, now);
        self.store.create(instance.clone()).await?;
        info!(instance_id = %instance.id, task_id = %task_id, "workflow instance created");
        Ok(instance)
    }

    /// Resume a due instance. A call before `wake_at`, or while another
    /// engine holds the lease, does nothing.
    pub async fn resume(&self, id: InstanceId, now: DateTime<Utc>) -> Result<ResumeOutcome, WorkflowError> {
        let Some(instance) = self
            .store
            .try_lease(id, &self.config.owner, self.config.lease, now)
            .await?
        else {
            debug!(instance_id = %id, "instance not resumable; skipping");
            return Ok(ResumeOutcome::Skipped);
        };

        self.drive(instance, now).await
    }

    /// Cancel every live instance of a task. Returns the cancelled ids.
    pub async fn cancel_for_task(
        &self,
        task_id: TaskId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<InstanceId>, WorkflowError> {
        let mut cancelled = Vec::new();
        for instance in self.store.find_by_task(task_id).await? {
            if self.cancel(&instance, reason, now).await? {
                cancelled.push(instance.id);
            }
        }
        Ok(cancelled)
    }

    async fn cancel(&self, instance: &WorkflowInstance, reason: &str, now: DateTime<Utc>) -> Result<bool, WorkflowError> {
        let changed = self.store.cancel(instance.id, reason, now).await?;
        if changed {
            info!(instance_id = %instance.id, task_id = %instance.task_id, reason, "workflow instance cancelled");
            emit(
                self.signals.as_ref(),
                PipelineSignal::InstanceCancelled {
                    instance_id: instance.id,
                    task_id: instance.task_id,
                    reason: reason.to_string(),
                },
            );
        }
        Ok(changed)
    }

    async fn drive(&self, instance: WorkflowInstance, now: DateTime<Utc>) -> Result<ResumeOutcome, WorkflowError> {
        let id = instance.id;
        match self.burst(instance, now).await {
            Err(WorkflowError::Store(WorkflowStoreError::LeaseLost(_))) => self.lease_lost(id).await,
            other => other,
        }
    }

    /// A write was refused mid-burst. A cancellation is a normal ending;
    /// anything else (a takeover) stays an error.
    async fn lease_lost(&self, id: InstanceId) -> Result<ResumeOutcome, WorkflowError> {
        match self.store.get(id).await? {
            Some(instance) if instance.state == InstanceState::Cancelled => {
                let reason = instance.last_error.unwrap_or_else(|| "cancelled".to_string());
                info!(instance_id = %id, reason = %reason, "workflow instance cancelled during burst");
                Ok(ResumeOutcome::Cancelled { reason })
            }
            _ => Err(WorkflowStoreError::LeaseLost(id).into()),
        }
    }

    async fn burst(&self, mut instance: WorkflowInstance, now: DateTime<Utc>) -> Result<ResumeOutcome, WorkflowError> {
        let id = instance.id;
        let owner = self.config.owner.as_str();

        match self.run(&mut instance, now).await {
            Ok(Progress::Sleep(until)) => {
                let wake_at = self.store.sleep_until(id, owner, until, None, now).await?;
                info!(instance_id = %id, wake_at = %wake_at, "workflow instance sleeping");
                Ok(ResumeOutcome::Sleeping { wake_at })
            }
            Ok(Progress::Done { reminded }) => {
                self.store.complete(id, owner, now).await?;
                info!(instance_id = %id, task_id = %instance.task_id, reminded, "workflow instance completed");
                emit(
                    self.signals.as_ref(),
                    PipelineSignal::InstanceCompleted {
                        instance_id: id,
                        task_id: instance.task_id,
                        reminded,
                    },
                );
                Ok(ResumeOutcome::Completed { reminded })
            }
            Err(WorkflowError::RecordNotFound(task_id)) => {
                let reason = format!("task {task_id} not found");
                self.cancel(&instance, &reason, now).await?;
                Ok(ResumeOutcome::Cancelled { reason })
            }
            Err(WorkflowError::Step { step, message }) => {
                let error = format!("{step}: {message}");
                let retry_at = now + to_chrono(self.config.step_retry_delay);
                let wake_at = self
                    .store
                    .sleep_until(id, owner, retry_at, Some(error.clone()), now)
                    .await?;
                warn!(instance_id = %id, step, error = %message, retry_at = %wake_at, "workflow step failed; retry scheduled");
                Ok(ResumeOutcome::RetryScheduled { wake_at, error })
            }
            Err(e) => Err(e),
        }
    }

    async fn run(&self, instance: &mut WorkflowInstance, now: DateTime<Utc>) -> Result<Progress, WorkflowError> {
        if !instance.is_step_done(steps::SEND_ASSIGNMENT) {
            let task = self.fetch(instance.task_id, steps::SEND_ASSIGNMENT).await?;
            let sent = self
                .dispatcher
                .send_assignment(&task, &instance.origin, &correlation(instance, steps::SEND_ASSIGNMENT))
                .await;
            let result = send_result(steps::SEND_ASSIGNMENT, sent)?;
            self.memoize(instance, steps::SEND_ASSIGNMENT, result, now).await?;
        }

        match instance.step(steps::WAIT_FOR_DUE_DATE).map(wait_target) {
            None => {
                let task = self.fetch(instance.task_id, steps::WAIT_FOR_DUE_DATE).await?;
                let Some(due) = task.due_date else {
                    debug!(instance_id = %instance.id, "task has no due date; nothing to remind");
                    return Ok(Progress::Done { reminded: false });
                };
                if task.is_due_on_day_of(now, self.config.due_date_offset) {
                    debug!(instance_id = %instance.id, "task is due today; skipping reminder");
                    return Ok(Progress::Done { reminded: false });
                }
                self.memoize(instance, steps::WAIT_FOR_DUE_DATE, json!({ "until": due }), now)
                    .await?;
                return Ok(Progress::Sleep(due));
            }
            Some(Some(until)) if now < until => return Ok(Progress::Sleep(until)),
            Some(_) => {}
        }

        if let Some(memo) = instance.step(steps::CHECK_AND_REMIND) {
            let reminded = memo.result["reminded"].as_bool().unwrap_or(false);
            return Ok(Progress::Done { reminded });
        }

        // Status comes from the source of truth, never from the memo.
        let task = self.fetch(instance.task_id, steps::CHECK_AND_REMIND).await?;
        if task.status.is_done() {
            self.memoize(
                instance,
                steps::CHECK_AND_REMIND,
                json!({ "status": task.status, "reminded": false }),
                now,
            )
            .await?;
            return Ok(Progress::Done { reminded: false });
        }

        if !instance.is_step_done(steps::SEND_REMINDER) {
            let sent = self
                .dispatcher
                .send_reminder(&task, &instance.origin, &correlation(instance, steps::SEND_REMINDER))
                .await;
            let result = send_result(steps::SEND_REMINDER, sent)?;
            self.memoize(instance, steps::SEND_REMINDER, result, now).await?;
        }

        let reminded = instance
            .step(steps::SEND_REMINDER)
            .and_then(|m| m.result["sent"].as_bool())
            .unwrap_or(false);
        self.memoize(
            instance,
            steps::CHECK_AND_REMIND,
            json!({ "status": task.status, "reminded": reminded }),
            now,
        )
        .await?;
        Ok(Progress::Done { reminded })
    }

    /// Re-read the task. A missing task or assignee ends the workflow; an
    /// unavailable source fails the current step.
    async fn fetch(&self, task_id: TaskId, step: &'static str) -> Result<TaskSnapshot, WorkflowError> {
        match self.tasks.fetch(task_id).await {
            Ok(Some(task)) if task.assignee.is_some() => Ok(task),
            Ok(_) => Err(WorkflowError::RecordNotFound(task_id)),
            Err(e) => Err(WorkflowError::Step {
                step,
                message: e.to_string(),
            }),
        }
    }

    async fn memoize(
        &self,
        instance: &mut WorkflowInstance,
        step: &str,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), WorkflowError> {
        let memo = StepMemo::completed(step, result, now);
        if self
            .store
            .record_step(instance.id, &self.config.owner, memo.clone(), now)
            .await?
        {
            instance.memo.insert(step.to_string(), memo);
        } else if let Some(stored) = self.store.get(instance.id).await? {
            // Someone recorded it first; theirs wins.
            instance.memo = stored.memo;
        }
        Ok(())
    }
}

fn correlation(instance: &WorkflowInstance, step: &str) -> String {
    format!("{}:{}", instance.id, step)
}

fn wait_target(memo: &StepMemo) -> Option<DateTime<Utc>> {
    serde_json::from_value(memo.result.get("until")?.clone()).ok()
}

/// Memo result for a send step. Transient failures fail the step; a
/// permanent one is recorded as not sent so the workflow can move on.
fn send_result(
    step: &'static str,
    sent: Result<MessageId, TransportError>,
) -> Result<serde_json::Value, WorkflowError> {
    match sent {
        Ok(id) => Ok(json!({ "sent": true, "messageId": id })),
        Err(e) if e.is_permanent() => {
            warn!(step, error = %e, "notification rejected permanently; not retrying");
            Ok(json!({ "sent": false, "error": e.to_string() }))
        }
        Err(e) => Err(WorkflowError::Step {
            step,
            message: e.to_string(),
        }),
    }
}
