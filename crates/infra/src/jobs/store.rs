//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use taskpulse_core::JobId;

use super::types::{Job, JobState};

/// Job store abstraction.
///
/// Every method is a single atomic transition on the backing store; workers
/// coordinate only through `claim_next` (lease) and `release` (compare-and-set
/// on the lease owner).
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job. The job is durable once this returns.
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Lease the oldest eligible job of `queue` to `worker`.
    ///
    /// Eligible: `Waiting`/`Failed`, `available_at <= now`, attempts left.
    /// FIFO by `(available_at, enqueue order)`. The returned job is already
    /// `Active` with its attempt counted.
    async fn claim_next(
        &self,
        queue: &str,
        worker: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Write back the outcome of an attempt.
    ///
    /// Succeeds only while `worker` still holds the lease on the stored job;
    /// otherwise returns `LeaseLost` and nothing is written. Releasing a
    /// completed job trims the queue's completed history to
    /// `policy.retain_completed`.
    async fn release(&self, job: &Job, worker: &str) -> Result<(), JobStoreError>;

    /// Recover jobs whose lease expired before `now`; returns them in their
    /// new state (`Failed` or `DeadLettered`).
    async fn reap_expired(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    /// List jobs of a queue, optionally filtered by state, oldest first.
    async fn list(
        &self,
        queue: &str,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Get job statistics for a queue.
    async fn stats(&self, queue: &str) -> Result<QueueStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("lease lost for job {0}")]
    LeaseLost(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Queue depth per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    /// Failed attempts waiting for their backoff delay
    pub delayed: usize,
    pub dead_lettered: usize,
}

impl QueueStats {
    /// Jobs that still need a worker.
    pub fn depth(&self) -> usize {
        self.waiting + self.active + self.delayed
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    /// Enqueue order, used as the FIFO tie-breaker.
    seq: HashMap<JobId, u64>,
    next_seq: u64,
}

/// In-memory job store for tests/dev. Not durable across restarts.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, JobStoreError> {
        self.inner
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, JobStoreError> {
        self.inner
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }
}

impl Inner {
    fn order_key(&self, job: &Job) -> (DateTime<Utc>, u64) {
        (job.available_at, self.seq.get(&job.id).copied().unwrap_or(u64::MAX))
    }

    fn trim_completed(&mut self, queue: &str, keep: usize) {
        let mut completed: Vec<(DateTime<Utc>, u64, JobId)> = self
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.state == JobState::Completed)
            .map(|j| {
                let seq = self.seq.get(&j.id).copied().unwrap_or_default();
                (j.finished_at.unwrap_or(j.updated_at), seq, j.id)
            })
            .collect();

        if completed.len() <= keep {
            return;
        }

        // Newest first (enqueue order breaks ties); everything past `keep` goes.
        completed.sort_by(|a, b| (b.0, b.1).cmp(&(a.0, a.1)));
        for (_, _, id) in completed.into_iter().skip(keep) {
            self.jobs.remove(&id);
            self.seq.remove(&id);
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut inner = self.write()?;
        if inner.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.seq.insert(id, seq);
        inner.jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut inner = self.write()?;

        let next = inner
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.is_ready(now))
            .min_by_key(|j| inner.order_key(j))
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };

        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;
        job.mark_active(worker, lease, now);
        Ok(Some(job.clone()))
    }

    async fn release(&self, job: &Job, worker: &str) -> Result<(), JobStoreError> {
        let mut inner = self.write()?;

        let stored = inner
            .jobs
            .get_mut(&job.id)
            .ok_or(JobStoreError::NotFound(job.id))?;

        if stored.state != JobState::Active || stored.lease_owner.as_deref() != Some(worker) {
            return Err(JobStoreError::LeaseLost(job.id));
        }

        *stored = job.clone();

        if job.state == JobState::Completed {
            inner.trim_completed(&job.queue, job.policy.retain_completed);
        }
        Ok(())
    }

    async fn reap_expired(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let mut inner = self.write()?;
        let mut reaped = Vec::new();

        for job in inner.jobs.values_mut() {
            let expired = job.queue == queue
                && job.state == JobState::Active
                && job.lease_expires_at.is_some_and(|at| at < now);
            if expired {
                job.mark_lease_expired(now);
                reaped.push(job.clone());
            }
        }

        Ok(reaped)
    }

    async fn list(
        &self,
        queue: &str,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read()?;
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.queue == queue && state.map_or(true, |s| j.state == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, inner.seq.get(&j.id).copied().unwrap_or_default()));
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, JobStoreError> {
        let inner = self.read()?;
        let mut stats = QueueStats::default();

        for job in inner.jobs.values().filter(|j| j.queue == queue) {
            match job.state {
                JobState::Waiting => stats.waiting += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.delayed += 1,
                JobState::DeadLettered => stats.dead_lettered += 1,
            }
        }

        Ok(stats)
    }
}
