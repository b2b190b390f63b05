//! Ingress glue: turns task events into a queued assignment job plus a
//! workflow instance, and runs queued jobs through the dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use taskpulse_core::{InstanceId, JobId, TaskId, TaskSnapshot};

use crate::jobs::{Job, JobHandler, JobPolicy, JobResult, JobStore, JobStoreError};
use crate::notify::{Dispatcher, templates};
use crate::tasks::{TaskSource, TaskSourceError};
use crate::workflow::{WorkflowEngine, WorkflowError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("task {0} not found")]
    TaskNotFound(TaskId),
    #[error("task {0} has no assignee")]
    NoAssignee(TaskId),
    #[error(transparent)]
    TaskSource(#[from] TaskSourceError),
    #[error(transparent)]
    Queue(#[from] JobStoreError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

/// Payload of an assignment job on the immediate queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentPayload {
    pub to: String,
    pub task: TaskSnapshot,
    pub origin: String,
}

/// What `on_task_assigned` managed to start. Either half may be missing; the
/// failure is logged and listed in `errors`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssignmentReceipt {
    pub job_id: Option<JobId>,
    pub instance_id: Option<InstanceId>,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct Pipeline {
    jobs: Arc<dyn JobStore>,
    engine: WorkflowEngine,
    tasks: Arc<dyn TaskSource>,
    queue: String,
    policy: JobPolicy,
}

impl Pipeline {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        engine: WorkflowEngine,
        tasks: Arc<dyn TaskSource>,
        queue: impl Into<String>,
        policy: JobPolicy,
    ) -> Self {
        Self {
            jobs,
            engine,
            tasks,
            queue: queue.into(),
            policy,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Enqueue the immediate assignment notice and start the reminder
    /// workflow for the same task. Returns once both are persisted; no
    /// notification is sent on the caller's time.
    ///
    /// Only a missing task (or one without an assignee) fails the call. A
    /// failure of one half does not stop the other.
    pub async fn on_task_assigned(
        &self,
        task_id: TaskId,
        origin: &str,
        now: DateTime<Utc>,
    ) -> Result<AssignmentReceipt, PipelineError> {
        let task = self
            .tasks
            .fetch(task_id)
            .await?
            .ok_or(PipelineError::TaskNotFound(task_id))?;
        let to = task
            .recipient()
            .ok_or(PipelineError::NoAssignee(task_id))?
            .to_string();

        let mut receipt = AssignmentReceipt::default();

        let payload = AssignmentPayload {
            to,
            task,
            origin: origin.to_string(),
        };
        match self.enqueue(&payload, now).await {
            Ok(job_id) => receipt.job_id = Some(job_id),
            Err(e) => {
                error!(task_id = %task_id, error = %e, "failed to enqueue assignment job");
                receipt.errors.push(e.to_string());
            }
        }

        match self.engine.start_instance(task_id, origin, now).await {
            Ok(instance_id) => {
                info!(task_id = %task_id, instance_id = %instance_id, "reminder workflow started");
                receipt.instance_id = Some(instance_id);
            }
            Err(e) => {
                error!(task_id = %task_id, error = %e, "failed to start reminder workflow");
                receipt.errors.push(e.to_string());
            }
        }

        Ok(receipt)
    }

    /// Cancel live workflow instances of removed tasks.
    pub async fn on_task_deleted(&self, task_ids: &[TaskId], now: DateTime<Utc>) -> Result<Vec<InstanceId>, PipelineError> {
        let mut cancelled = Vec::new();
        for &task_id in task_ids {
            let ids = self.engine.cancel_for_task(task_id, "task deleted", now).await?;
            if ids.is_empty() {
                info!(task_id = %task_id, "no live workflow instance for deleted task");
            }
            cancelled.extend(ids);
        }
        Ok(cancelled)
    }

    async fn enqueue(&self, payload: &AssignmentPayload, now: DateTime<Utc>) -> Result<JobId, PipelineError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| JobStoreError::Storage(format!("failed to encode job payload: {e}")))?;
        let job = Job::new(self.queue.clone(), payload, self.policy.clone(), now);
        let job_id = self.jobs.enqueue(job).await?;
        info!(job_id = %job_id, queue = %self.queue, "assignment job enqueued");
        Ok(job_id)
    }
}

/// Sends the assignment notice for jobs enqueued by [`Pipeline`].
pub struct AssignmentHandler {
    dispatcher: Dispatcher,
}

impl AssignmentHandler {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl JobHandler for AssignmentHandler {
    async fn handle(&self, job: &Job) -> JobResult {
        let payload: AssignmentPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => return JobResult::PermanentFailure(format!("invalid assignment payload: {e}")),
        };

        let notice = templates::assignment(&payload.task, &payload.origin, self.dispatcher.offset());
        match self
            .dispatcher
            .send(&payload.to, &notice.subject, &notice.body_html, &job.id.to_string())
            .await
        {
            Ok(_) => JobResult::Success,
            Err(e) if e.is_permanent() => {
                warn!(job_id = %job.id, error = %e, "assignment notice rejected");
                JobResult::PermanentFailure(e.to_string())
            }
            Err(e) => JobResult::Failure(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{InMemoryJobStore, JobExecutor, JobExecutorConfig, JobOutcome, JobState};
    use crate::notify::{MemoryTransport, TransportError};
    use crate::tasks::InMemoryTaskSource;
    use crate::workflow::{InMemoryWorkflowStore, InstanceState, WorkflowConfig, WorkflowStore};
    use chrono::TimeZone;
    use taskpulse_core::{Assignee, ProjectRef, TaskStatus};

    struct Fixture {
        jobs: Arc<InMemoryJobStore>,
        workflows: Arc<InMemoryWorkflowStore>,
        tasks: Arc<InMemoryTaskSource>,
        transport: Arc<MemoryTransport>,
        pipeline: Pipeline,
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryTransport::new()))
    }

    fn fixture_with(transport: Arc<MemoryTransport>) -> Fixture {
        let jobs = InMemoryJobStore::arc();
        let workflows = InMemoryWorkflowStore::arc();
        let tasks = Arc::new(InMemoryTaskSource::new());
        let engine = WorkflowEngine::new(
            workflows.clone(),
            tasks.clone(),
            Dispatcher::new(transport.clone()),
            WorkflowConfig::default(),
        );
        let pipeline = Pipeline::new(jobs.clone(), engine, tasks.clone(), "email-queue", JobPolicy::default());
        Fixture {
            jobs,
            workflows,
            tasks,
            transport,
            pipeline,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap()
    }

    fn add_task(f: &Fixture, assignee: Option<Assignee>) -> TaskId {
        let id = TaskId::new();
        f.tasks.upsert(TaskSnapshot {
            id,
            title: "Write report".into(),
            description: "Q2 numbers".into(),
            status: TaskStatus::Todo,
            due_date: Some(Utc.with_ymd_and_hms(2026, 6, 4, 10, 0, 0).unwrap()),
            project: ProjectRef { name: "Finance".into() },
            assignee,
        });
        id
    }

    /// Wait for the spawned first burst to leave `Running`.
    async fn settled(f: &Fixture, id: InstanceId) -> crate::workflow::WorkflowInstance {
        for _ in 0..100 {
            let instance = f.workflows.get(id).await.unwrap().unwrap();
            if instance.state != InstanceState::Running {
                return instance;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("first burst did not finish");
    }

    fn sam() -> Option<Assignee> {
        Some(Assignee {
            name: "Sam".into(),
            email: "sam@example.com".into(),
        })
    }

    #[tokio::test]
    async fn assigned_task_gets_job_and_workflow() {
        let f = fixture();
        let task_id = add_task(&f, sam());

        let receipt = f.pipeline.on_task_assigned(task_id, "https://app", now()).await.unwrap();

        let job = f.jobs.get(receipt.job_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.payload["to"], "sam@example.com");
        assert_eq!(job.payload["task"]["project"]["name"], "Finance");
        assert_eq!(job.payload["origin"], "https://app");

        let instance = settled(&f, receipt.instance_id.unwrap()).await;
        assert_eq!(instance.state, InstanceState::Sleeping);
        assert!(receipt.errors.is_empty());
    }

    #[tokio::test]
    async fn unknown_task_is_rejected() {
        let f = fixture();
        let err = f.pipeline.on_task_assigned(TaskId::new(), "", now()).await.unwrap_err();
        assert!(matches!(err, PipelineError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn unassigned_task_is_rejected() {
        let f = fixture();
        let task_id = add_task(&f, None);
        let err = f.pipeline.on_task_assigned(task_id, "", now()).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoAssignee(_)));
    }

    #[tokio::test]
    async fn workflow_failure_does_not_drop_the_job() {
        let f = fixture();
        let task_id = add_task(&f, sam());
        // The workflow's first send fails; its retry is scheduled, not lost.
        f.transport.fail_next(TransportError::transient("relay down"));

        let receipt = f.pipeline.on_task_assigned(task_id, "", now()).await.unwrap();

        assert!(receipt.job_id.is_some());
        let instance = settled(&f, receipt.instance_id.unwrap()).await;
        assert_eq!(instance.state, InstanceState::Sleeping);
        assert!(instance.last_error.is_some());
    }

    #[tokio::test]
    async fn deleted_tasks_cancel_their_workflows() {
        let f = fixture();
        let first = add_task(&f, sam());
        let second = add_task(&f, sam());
        let a = f.pipeline.on_task_assigned(first, "", now()).await.unwrap();
        let b = f.pipeline.on_task_assigned(second, "", now()).await.unwrap();
        settled(&f, a.instance_id.unwrap()).await;
        settled(&f, b.instance_id.unwrap()).await;

        let cancelled = f.pipeline.on_task_deleted(&[first, second, TaskId::new()], now()).await.unwrap();

        assert_eq!(cancelled, vec![a.instance_id.unwrap(), b.instance_id.unwrap()]);
        for id in cancelled {
            let instance = f.workflows.get(id).await.unwrap().unwrap();
            assert_eq!(instance.state, InstanceState::Cancelled);
        }
    }

    #[tokio::test]
    async fn slow_relay_does_not_hold_up_ingress() {
        let f = fixture_with(Arc::new(MemoryTransport::new().with_latency(std::time::Duration::from_secs(5))));
        let task_id = add_task(&f, sam());

        let receipt = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            f.pipeline.on_task_assigned(task_id, "", now()),
        )
        .await
        .expect("ingress waited on the relay")
        .unwrap();

        let instance = f.workflows.get(receipt.instance_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(instance.state, InstanceState::Running);
        assert!(f.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn handler_sends_assignment_from_payload() {
        let f = fixture();
        let task_id = add_task(&f, sam());
        let receipt = f.pipeline.on_task_assigned(task_id, "https://app", now()).await.unwrap();

        settled(&f, receipt.instance_id.unwrap()).await;

        let handler = Arc::new(AssignmentHandler::new(Dispatcher::new(f.transport.clone())));
        let executor = JobExecutor::new(f.jobs.clone(), handler, JobExecutorConfig::default());
        let outcome = executor.process_next("w1", now()).await.unwrap().unwrap();

        assert!(matches!(outcome, JobOutcome::Completed(ref job) if Some(job.id) == receipt.job_id));
        // One from the queue, one from the workflow's first step.
        let sent = f.transport.sent_with_subject("New Task Assigned in Finance");
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| m.to == "sam@example.com"));
    }

    #[tokio::test]
    async fn invalid_payload_is_dead_lettered() {
        let f = fixture();
        f.jobs
            .enqueue(Job::new("email-queue", serde_json::json!({ "bogus": true }), JobPolicy::default(), now()))
            .await
            .unwrap();

        let handler = Arc::new(AssignmentHandler::new(Dispatcher::new(f.transport.clone())));
        let executor = JobExecutor::new(f.jobs.clone(), handler, JobExecutorConfig::default());
        let outcome = executor.process_next("w1", now()).await.unwrap().unwrap();

        assert!(matches!(outcome, JobOutcome::DeadLettered(_)));
        assert!(f.transport.sent().is_empty());
    }
}
