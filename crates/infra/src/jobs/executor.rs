//! Job executor: a pool of async workers draining one queue.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use taskpulse_events::PipelineSignal;

use super::store::{JobStore, JobStoreError};
use super::types::{FailureDisposition, Job, JobResult, JobState};
use crate::signals::{SignalBus, emit};

/// Processes the payload of a leased job.
///
/// Handlers must be idempotent with respect to their side effect: a job whose
/// lease expires mid-flight is run again.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> JobResult;
}

/// Job executor configuration.
#[derive(Debug, Clone)]
pub struct JobExecutorConfig {
    /// Queue to drain
    pub queue: String,
    /// Number of concurrent workers
    pub concurrency: usize,
    /// How long an idle worker sleeps before polling again
    pub poll_interval: Duration,
    /// Lease granted per claim; an unreleased job becomes claimable after it
    pub lease: Duration,
    /// Upper bound on a single handler invocation
    pub handler_timeout: Duration,
    /// How often expired leases are reaped
    pub reap_interval: Duration,
    /// Name for logging and worker ids
    pub name: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            queue: "email-queue".to_string(),
            concurrency: 2,
            poll_interval: Duration::from_millis(250),
            lease: Duration::from_secs(60),
            handler_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(5),
            name: "job-executor".to_string(),
        }
    }
}

impl JobExecutorConfig {
    pub fn for_queue(queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            name: format!("{queue}-worker"),
            queue,
            ..Default::default()
        }
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
    pub leases_lost: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// What one `process_next` call did.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Job),
    Retrying(Job),
    DeadLettered(Job),
    /// The lease was reaped while the handler ran; the result was discarded.
    LeaseLost(Job),
}

impl JobOutcome {
    pub fn job(&self) -> &Job {
        match self {
            JobOutcome::Completed(j)
            | JobOutcome::Retrying(j)
            | JobOutcome::DeadLettered(j)
            | JobOutcome::LeaseLost(j) => j,
        }
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
    started: Instant,
}

impl JobExecutorHandle {
    /// Stop claiming new jobs and wait for in-flight ones to be released.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for join in self.joins {
            if let Err(e) = join.await {
                warn!(error = %e, "job worker ended abnormally");
            }
        }
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        let mut stats = lock(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

/// Background job executor.
///
/// Leases jobs from a [`JobStore`], runs the handler under a timeout, and
/// writes the outcome back (completion, delayed retry, or dead letter).
/// Terminal outcomes are announced on the signal bus exactly once, after the
/// store accepted them.
#[derive(Clone)]
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    signals: Option<SignalBus>,
    config: JobExecutorConfig,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutor {
    pub fn new(store: Arc<dyn JobStore>, handler: Arc<dyn JobHandler>, config: JobExecutorConfig) -> Self {
        Self {
            store,
            handler,
            signals: None,
            config,
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    pub fn with_signals(mut self, bus: SignalBus) -> Self {
        self.signals = Some(bus);
        self
    }

    pub fn config(&self) -> &JobExecutorConfig {
        &self.config
    }

    /// Claim one eligible job as `worker` at `now` and run it to an outcome.
    ///
    /// Returns `Ok(None)` when nothing is eligible.
    pub async fn process_next(
        &self,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<JobOutcome>, JobStoreError> {
        let Some(mut job) = self
            .store
            .claim_next(&self.config.queue, worker, self.config.lease, now)
            .await?
        else {
            return Ok(None);
        };

        debug!(
            executor = %self.config.name,
            worker,
            job_id = %job.id,
            attempt = job.attempts,
            "claimed job"
        );

        lock(&self.stats).current_running += 1;
        let clock = Instant::now();
        let result = match tokio::time::timeout(self.config.handler_timeout, self.handler.handle(&job)).await {
            Ok(result) => result,
            Err(_) => JobResult::Failure(format!(
                "handler timed out after {}ms",
                self.config.handler_timeout.as_millis()
            )),
        };
        let finished = now + super::types::to_chrono(clock.elapsed());
        lock(&self.stats).current_running -= 1;

        let disposition = match &result {
            JobResult::Success => {
                job.mark_completed(now, finished);
                None
            }
            JobResult::Failure(error) => Some(job.mark_failed(error, false, now, finished)),
            JobResult::PermanentFailure(error) => Some(job.mark_failed(error, true, now, finished)),
        };

        match self.store.release(&job, worker).await {
            Ok(()) => {}
            Err(JobStoreError::LeaseLost(_)) => {
                warn!(job_id = %job.id, worker, "lease lost before release; discarding result");
                let mut stats = lock(&self.stats);
                stats.jobs_processed += 1;
                stats.leases_lost += 1;
                return Ok(Some(JobOutcome::LeaseLost(job)));
            }
            Err(e) => return Err(e),
        }

        let outcome = match disposition {
            None => {
                info!(job_id = %job.id, attempts = job.attempts, "job completed");
                emit(
                    self.signals.as_ref(),
                    PipelineSignal::JobCompleted {
                        queue: job.queue.clone(),
                        job_id: job.id,
                    },
                );
                JobOutcome::Completed(job)
            }
            Some(FailureDisposition::RetryAt(at)) => {
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    retry_at = %at,
                    error = job.last_error.as_deref().unwrap_or_default(),
                    "job failed; retry scheduled"
                );
                JobOutcome::Retrying(job)
            }
            Some(FailureDisposition::DeadLettered) => {
                self.announce_dead_letter(&job);
                JobOutcome::DeadLettered(job)
            }
        };

        let mut stats = lock(&self.stats);
        stats.jobs_processed += 1;
        match outcome {
            JobOutcome::Completed(_) => stats.jobs_succeeded += 1,
            JobOutcome::Retrying(_) => stats.jobs_retried += 1,
            JobOutcome::DeadLettered(_) => stats.jobs_dead_lettered += 1,
            JobOutcome::LeaseLost(_) => {}
        }
        drop(stats);

        Ok(Some(outcome))
    }

    /// Recover jobs whose worker vanished. Returns how many were reaped.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let reaped = self.store.reap_expired(&self.config.queue, now).await?;
        for job in &reaped {
            if job.state == JobState::DeadLettered {
                lock(&self.stats).jobs_dead_lettered += 1;
                self.announce_dead_letter(job);
            } else {
                info!(job_id = %job.id, attempts = job.attempts, "expired lease; job requeued");
            }
        }
        Ok(reaped.len())
    }

    fn announce_dead_letter(&self, job: &Job) {
        let reason = job.last_error.clone().unwrap_or_default();
        error!(
            job_id = %job.id,
            queue = %job.queue,
            attempts = job.attempts,
            error = %reason,
            "job dead-lettered"
        );
        emit(
            self.signals.as_ref(),
            PipelineSignal::JobDeadLettered {
                queue: job.queue.clone(),
                job_id: job.id,
                attempts: job.attempts,
                reason,
            },
        );
    }

    /// Spawn the worker pool and the lease reaper on the current runtime.
    pub fn spawn(self) -> JobExecutorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let mut joins = Vec::with_capacity(self.config.concurrency + 1);

        info!(
            executor = %self.config.name,
            queue = %self.config.queue,
            concurrency = self.config.concurrency,
            "job executor started"
        );

        for n in 0..self.config.concurrency.max(1) {
            let worker = format!("{}-{}-{}", self.config.name, std::process::id(), n);
            joins.push(tokio::spawn(worker_loop(self.clone(), worker, shutdown_rx.clone())));
        }
        joins.push(tokio::spawn(reaper_loop(self, shutdown_rx)));

        JobExecutorHandle {
            shutdown: shutdown_tx,
            joins,
            stats,
            started: Instant::now(),
        }
    }
}

async fn worker_loop(executor: JobExecutor, worker: String, mut shutdown: watch::Receiver<bool>) {
    debug!(worker = %worker, "job worker started");

    while !*shutdown.borrow() {
        let idle = match executor.process_next(&worker, Utc::now()).await {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(e) => {
                error!(worker = %worker, error = %e, "failed to process job");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(executor.config.poll_interval) => {}
            }
        }
    }

    debug!(worker = %worker, "job worker stopped");
}

async fn reaper_loop(executor: JobExecutor, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(executor.config.reap_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                if let Err(e) = executor.reap_expired(Utc::now()).await {
                    error!(queue = %executor.config.queue, error = %e, "failed to reap expired leases");
                }
            }
        }
    }
}

fn lock(stats: &Mutex<ExecutorStats>) -> std::sync::MutexGuard<'_, ExecutorStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::JobPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};
    use taskpulse_events::{EventBus, InMemoryEventBus};

    /// Fails the first `failures` calls, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, _job: &Job) -> JobResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                JobResult::Failure(format!("smtp unavailable (call {n})"))
            } else {
                JobResult::Success
            }
        }
    }

    struct Permanent;

    #[async_trait]
    impl JobHandler for Permanent {
        async fn handle(&self, _job: &Job) -> JobResult {
            JobResult::PermanentFailure("550 mailbox unavailable".into())
        }
    }

    struct Slow(Duration);

    #[async_trait]
    impl JobHandler for Slow {
        async fn handle(&self, _job: &Job) -> JobResult {
            tokio::time::sleep(self.0).await;
            JobResult::Success
        }
    }

    fn setup(handler: Arc<dyn JobHandler>) -> (Arc<InMemoryJobStore>, JobExecutor, SignalBus) {
        let store = InMemoryJobStore::arc();
        let bus: SignalBus = Arc::new(InMemoryEventBus::new());
        let executor = JobExecutor::new(store.clone(), handler, JobExecutorConfig::for_queue("email-queue"))
            .with_signals(bus.clone());
        (store, executor, bus)
    }

    async fn enqueue(store: &InMemoryJobStore, now: DateTime<Utc>) -> taskpulse_core::JobId {
        store
            .enqueue(Job::new("email-queue", serde_json::json!({"to": "sam@example.com"}), JobPolicy::default(), now))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn transient_failures_back_off_then_complete() {
        let handler = Flaky::new(2);
        let (store, executor, bus) = setup(handler.clone());
        let signals = bus.subscribe();
        let now = Utc::now();
        let id = enqueue(&store, now).await;

        // Attempt 1 fails: retry 2000ms later.
        let first = executor.process_next("w", now).await.unwrap().unwrap();
        let JobOutcome::Retrying(job) = first else {
            panic!("expected retry, got {first:?}");
        };
        assert_eq!(job.available_at - job.updated_at, chrono::Duration::milliseconds(2000));
        assert!(executor.process_next("w", job.updated_at).await.unwrap().is_none());

        // Attempt 2 fails: retry 4000ms later.
        let second = executor.process_next("w", job.available_at).await.unwrap().unwrap();
        let JobOutcome::Retrying(job) = second else {
            panic!("expected retry, got {second:?}");
        };
        assert_eq!(job.attempts, 2);
        assert_eq!(job.available_at - job.updated_at, chrono::Duration::milliseconds(4000));

        // Attempt 3 succeeds.
        let third = executor.process_next("w", job.available_at).await.unwrap().unwrap();
        assert!(matches!(third, JobOutcome::Completed(ref j) if j.attempts == 3));

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            signals.drain(),
            vec![PipelineSignal::JobCompleted {
                queue: "email-queue".into(),
                job_id: id
            }]
        );
    }

    #[tokio::test]
    async fn exhausted_attempts_dead_letter_once() {
        let (store, executor, bus) = setup(Flaky::new(u32::MAX));
        let signals = bus.subscribe();
        let mut now = Utc::now();
        let id = enqueue(&store, now).await;

        for _ in 0..3 {
            executor.process_next("w", now).await.unwrap().unwrap();
            now += chrono::Duration::hours(1);
        }
        assert!(executor.process_next("w", now).await.unwrap().is_none());

        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::DeadLettered);
        assert_eq!(stored.attempts, 3);
        assert_eq!(stored.last_error.as_deref(), Some("smtp unavailable (call 3)"));

        let dead: Vec<_> = signals
            .drain()
            .into_iter()
            .filter(|s| matches!(s, PipelineSignal::JobDeadLettered { .. }))
            .collect();
        assert_eq!(dead.len(), 1);
        assert!(matches!(&dead[0], PipelineSignal::JobDeadLettered { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn permanent_failure_skips_retries() {
        let (store, executor, _bus) = setup(Arc::new(Permanent));
        let now = Utc::now();
        enqueue(&store, now).await;

        let outcome = executor.process_next("w", now).await.unwrap().unwrap();
        assert!(matches!(outcome, JobOutcome::DeadLettered(ref j) if j.attempts == 1));
    }

    #[tokio::test]
    async fn slow_handler_times_out_as_transient_failure() {
        let store = InMemoryJobStore::arc();
        let executor = JobExecutor::new(
            store.clone(),
            Arc::new(Slow(Duration::from_secs(5))),
            JobExecutorConfig::for_queue("email-queue").with_handler_timeout(Duration::from_millis(20)),
        );
        let now = Utc::now();
        enqueue(&store, now).await;

        let outcome = executor.process_next("w", now).await.unwrap().unwrap();
        let JobOutcome::Retrying(job) = outcome else {
            panic!("expected retry, got {outcome:?}");
        };
        assert!(job.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn reaped_lease_discards_late_result() {
        let store = InMemoryJobStore::arc();
        let executor = JobExecutor::new(
            store.clone(),
            Arc::new(Slow(Duration::from_millis(50))),
            JobExecutorConfig::for_queue("email-queue").with_lease(Duration::from_millis(1)),
        );
        let now = Utc::now();
        let id = enqueue(&store, now).await;

        let reaper = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                store
                    .reap_expired("email-queue", now + chrono::Duration::seconds(1))
                    .await
                    .unwrap()
            })
        };

        let outcome = executor.process_next("w", now).await.unwrap().unwrap();
        assert_eq!(reaper.await.unwrap().len(), 1);
        assert!(matches!(outcome, JobOutcome::LeaseLost(_)));
        assert_eq!(store.get(id).await.unwrap().unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn spawned_pool_drains_queue() {
        let handler = Flaky::new(0);
        let store = InMemoryJobStore::arc();
        let executor = JobExecutor::new(
            store.clone(),
            handler.clone(),
            JobExecutorConfig::for_queue("email-queue")
                .with_concurrency(3)
                .with_poll_interval(Duration::from_millis(5)),
        );

        for _ in 0..10 {
            enqueue(&store, Utc::now()).await;
        }

        let handle = executor.spawn();
        for _ in 0..200 {
            if handle.stats().jobs_succeeded == 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(store.stats("email-queue").await.unwrap().completed, 10);
        handle.shutdown().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 10);
    }
}
