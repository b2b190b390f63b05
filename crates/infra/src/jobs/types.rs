//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskpulse_core::JobId;

/// Job lifecycle state.
///
/// `Waiting → Active → Completed`, or `Active → Failed` (delayed retry) →
/// `Active` … until attempts run out, then `DeadLettered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued, eligible once `available_at` has passed
    Waiting,
    /// Leased by a worker
    Active,
    /// Completed successfully
    Completed,
    /// Last attempt failed; eligible again once the backoff delay has passed
    Failed,
    /// Exhausted retries or failed permanently; never retried again
    DeadLettered,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::DeadLettered)
    }

    /// States a worker may lease from (subject to `available_at`).
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobState::Waiting | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::DeadLettered => "dead_lettered",
        }
    }
}

impl core::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead_lettered" => Ok(JobState::DeadLettered),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(2000), Duration::from_secs(3600))
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };

        delay.min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` have been used.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Per-job queue policy: retries plus history retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPolicy {
    pub retry: RetryPolicy,
    /// How many completed jobs of the same queue to keep for inspection.
    pub retain_completed: usize,
    /// Keep the record of every failed attempt on the job. When `false` only
    /// `last_error` survives a failure. Dead-lettered jobs themselves are
    /// always kept for operator inspection.
    pub retain_failed: bool,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            retain_completed: 100,
            retain_failed: false,
        }
    }
}

impl JobPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.retry.max_attempts
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Queue (partition) the job belongs to
    pub queue: String,
    /// JSON payload handed to the handler
    pub payload: serde_json::Value,
    pub state: JobState,
    pub policy: JobPolicy,
    /// Attempts started so far (incremented when a worker leases the job)
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time a worker may lease the job
    pub available_at: DateTime<Utc>,
    /// Worker currently holding the lease
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// When the job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
    /// Attempt records (failed ones only when `policy.retain_failed`)
    pub history: Vec<JobAttemptRecord>,
}

/// Record of a job execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Will be retried at the given time.
    RetryAt(DateTime<Utc>),
    /// Terminal; announce it.
    DeadLettered,
}

impl Job {
    /// Create a new waiting job, eligible immediately.
    pub fn new(
        queue: impl Into<String>,
        payload: serde_json::Value,
        policy: JobPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            payload,
            state: JobState::Waiting,
            policy,
            attempts: 0,
            created_at: now,
            updated_at: now,
            available_at: now,
            lease_owner: None,
            lease_expires_at: None,
            last_error: None,
            finished_at: None,
            history: Vec::new(),
        }
    }

    /// Delay the first attempt.
    pub fn delayed_until(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = at;
        self
    }

    /// Check if a worker may lease the job at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state.is_claimable()
            && self.available_at <= now
            && self.policy.retry.should_retry(self.attempts)
    }

    /// Lease the job to `worker` and count the attempt.
    pub fn mark_active(&mut self, worker: &str, lease: std::time::Duration, now: DateTime<Utc>) {
        self.state = JobState::Active;
        self.attempts += 1;
        self.lease_owner = Some(worker.to_string());
        self.lease_expires_at = Some(now + to_chrono(lease));
        self.updated_at = now;
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self, started_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.clear_lease(now);
        self.finished_at = Some(now);
        self.history.push(JobAttemptRecord {
            attempt: self.attempts,
            started_at,
            finished_at: now,
            success: true,
            error: None,
            duration_ms: duration_ms(started_at, now),
        });
    }

    /// Record a failed attempt and decide between a delayed retry and the
    /// dead-letter state. Permanent failures are never retried.
    pub fn mark_failed(
        &mut self,
        error: &str,
        permanent: bool,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> FailureDisposition {
        self.clear_lease(now);
        self.last_error = Some(error.to_string());

        if self.policy.retain_failed {
            self.history.push(JobAttemptRecord {
                attempt: self.attempts,
                started_at,
                finished_at: now,
                success: false,
                error: Some(error.to_string()),
                duration_ms: duration_ms(started_at, now),
            });
        }

        if !permanent && self.policy.retry.should_retry(self.attempts) {
            let delay = self.policy.retry.delay_for_attempt(self.attempts);
            let at = now + to_chrono(delay);
            self.state = JobState::Failed;
            self.available_at = at;
            FailureDisposition::RetryAt(at)
        } else {
            self.state = JobState::DeadLettered;
            self.finished_at = Some(now);
            FailureDisposition::DeadLettered
        }
    }

    /// The lease ran out without a release (crashed or stuck worker).
    ///
    /// The attempt counts as failed; when it was the last one the job is
    /// dead-lettered instead of requeued.
    pub fn mark_lease_expired(&mut self, now: DateTime<Utc>) -> FailureDisposition {
        self.clear_lease(now);
        self.last_error = Some("lease expired".to_string());

        if self.policy.retry.should_retry(self.attempts) {
            self.state = JobState::Failed;
            self.available_at = now;
            FailureDisposition::RetryAt(now)
        } else {
            self.state = JobState::DeadLettered;
            self.finished_at = Some(now);
            FailureDisposition::DeadLettered
        }
    }

    fn clear_lease(&mut self, now: DateTime<Utc>) {
        self.lease_owner = None;
        self.lease_expires_at = None;
        self.updated_at = now;
    }
}

/// Result of a handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Job completed successfully
    Success,
    /// Transient failure; retry per policy
    Failure(String),
    /// Retrying cannot help (e.g. invalid recipient); dead-letter now
    PermanentFailure(String),
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn duration_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy(max_attempts: u32) -> JobPolicy {
        JobPolicy {
            retry: RetryPolicy::exponential(
                max_attempts,
                Duration::from_millis(2000),
                Duration::from_secs(3600),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn exponential_backoff_doubles_from_base() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::exponential(40, Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(30));
    }

    #[test]
    fn fixed_and_linear_backoff() {
        let fixed = RetryPolicy::fixed(3, Duration::from_millis(500));
        assert_eq!(fixed.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(fixed.delay_for_attempt(3), Duration::from_millis(500));

        let linear = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            ..RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_secs(10))
        };
        assert_eq!(linear.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn default_policy_matches_queue_defaults() {
        let p = JobPolicy::default();
        assert_eq!(p.max_attempts(), 3);
        assert_eq!(p.retry.base_delay, Duration::from_millis(2000));
        assert_eq!(p.retry.strategy, BackoffStrategy::Exponential);
        assert_eq!(p.retain_completed, 100);
        assert!(!p.retain_failed);
    }

    #[test]
    fn failure_schedules_retry_then_dead_letters() {
        let now = Utc::now();
        let mut job = Job::new("email-queue", serde_json::json!({}), policy(2), now);

        job.mark_active("w1", Duration::from_secs(60), now);
        let d = job.mark_failed("smtp timeout", false, now, now);
        assert_eq!(d, FailureDisposition::RetryAt(now + chrono::Duration::milliseconds(2000)));
        assert_eq!(job.state, JobState::Failed);
        assert!(!job.is_ready(now));
        assert!(job.is_ready(now + chrono::Duration::milliseconds(2000)));

        job.mark_active("w1", Duration::from_secs(60), now);
        let d = job.mark_failed("smtp timeout", false, now, now);
        assert_eq!(d, FailureDisposition::DeadLettered);
        assert_eq!(job.state, JobState::DeadLettered);
        assert_eq!(job.last_error.as_deref(), Some("smtp timeout"));
        assert!(!job.is_ready(now + chrono::Duration::days(1)));
    }

    #[test]
    fn permanent_failure_dead_letters_on_first_attempt() {
        let now = Utc::now();
        let mut job = Job::new("email-queue", serde_json::json!({}), policy(3), now);

        job.mark_active("w1", Duration::from_secs(60), now);
        let d = job.mark_failed("invalid recipient", true, now, now);

        assert_eq!(d, FailureDisposition::DeadLettered);
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn failed_attempts_recorded_only_when_retained() {
        let now = Utc::now();
        let mut dropped = Job::new("q", serde_json::json!({}), policy(3), now);
        dropped.mark_active("w", Duration::from_secs(1), now);
        dropped.mark_failed("boom", false, now, now);
        assert!(dropped.history.is_empty());

        let mut kept = Job::new(
            "q",
            serde_json::json!({}),
            JobPolicy {
                retain_failed: true,
                ..policy(3)
            },
            now,
        );
        kept.mark_active("w", Duration::from_secs(1), now);
        kept.mark_failed("boom", false, now, now);
        assert_eq!(kept.history.len(), 1);
        assert!(!kept.history[0].success);
    }

    #[test]
    fn expired_lease_on_last_attempt_dead_letters() {
        let now = Utc::now();
        let mut job = Job::new("q", serde_json::json!({}), policy(1), now);
        job.mark_active("w", Duration::from_secs(1), now);

        assert_eq!(job.mark_lease_expired(now), FailureDisposition::DeadLettered);
        assert_eq!(job.last_error.as_deref(), Some("lease expired"));
    }

    proptest! {
        /// Property: whatever the sequence of outcomes, a job never uses more
        /// attempts than its policy allows, and once terminal it stays put.
        #[test]
        fn attempts_never_exceed_max(
            max_attempts in 1u32..6,
            outcomes in prop::collection::vec(0u8..4, 1..20)
        ) {
            let mut now = Utc::now();
            let mut job = Job::new("q", serde_json::json!({}), policy(max_attempts), now);

            for outcome in outcomes {
                now += chrono::Duration::hours(2);
                if !job.is_ready(now) {
                    prop_assert!(job.state.is_terminal());
                    continue;
                }
                job.mark_active("w", Duration::from_secs(5), now);
                match outcome {
                    0 => job.mark_completed(now, now),
                    1 => { job.mark_failed("transient", false, now, now); }
                    2 => { job.mark_failed("permanent", true, now, now); }
                    _ => { job.mark_lease_expired(now); }
                }
                prop_assert!(job.attempts <= max_attempts);
            }

            prop_assert!(job.attempts <= max_attempts);
            if job.state == JobState::DeadLettered || job.state == JobState::Completed {
                prop_assert!(!job.is_ready(now + chrono::Duration::days(365)));
            }
        }
    }
}
