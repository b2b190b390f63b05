//! Postgres-backed job store.
//!
//! Durable counterpart of [`InMemoryJobStore`](super::InMemoryJobStore): an
//! enqueued job survives process restarts, and any number of worker processes
//! can share one queue.
//!
//! ## Concurrency
//!
//! - `claim_next` picks the oldest eligible row with `FOR UPDATE SKIP LOCKED`
//!   and flips it to `active` in the same statement, so two workers never
//!   lease the same job.
//! - `release` is a compare-and-set on `(state = 'active', lease_owner)`. A
//!   worker whose lease was reaped gets `LeaseLost` and writes nothing.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (enqueue only) |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Other | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::{instrument, warn};

use taskpulse_core::JobId;

use super::store::{JobStore, JobStoreError, QueueStats};
use super::types::{Job, JobAttemptRecord, JobPolicy, JobState, to_chrono};

const JOB_COLUMNS: &str = r#"
    id, queue, payload, state, policy, attempts, created_at, updated_at,
    available_at, lease_owner, lease_expires_at, last_error, finished_at, history
"#;

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn trim_completed(&self, queue: &str, keep: usize) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE id IN (
                SELECT id FROM jobs
                WHERE queue = $1 AND state = 'completed'
                ORDER BY finished_at DESC, seq DESC
                OFFSET $2
            )
            "#,
        )
        .bind(queue)
        .bind(keep as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("trim_completed", e))?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue), err)]
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let policy = to_json(&job.policy)?;
        let history = to_json(&job.history)?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, queue, payload, state, policy, max_attempts, attempts,
                created_at, updated_at, available_at, lease_owner,
                lease_expires_at, last_error, finished_at, history
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.queue)
        .bind(&job.payload)
        .bind(job.state.as_str())
        .bind(policy)
        .bind(job.policy.max_attempts() as i32)
        .bind(job.attempts as i32)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.available_at)
        .bind(&job.lease_owner)
        .bind(job.lease_expires_at)
        .bind(&job.last_error)
        .bind(job.finished_at)
        .bind(history)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("enqueue", e)
            }
        })?;

        Ok(job.id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| decode(&r)).transpose()
    }

    #[instrument(skip(self, lease), fields(queue = %queue, worker = %worker), err)]
    async fn claim_next(
        &self,
        queue: &str,
        worker: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = 'active',
                attempts = attempts + 1,
                lease_owner = $2,
                lease_expires_at = $3,
                updated_at = $4
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = $1
                  AND state IN ('waiting', 'failed')
                  AND available_at <= $4
                  AND attempts < max_attempts
                ORDER BY available_at ASC, seq ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(queue)
        .bind(worker)
        .bind(now + to_chrono(lease))
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.map(|r| decode(&r)).transpose()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, state = %job.state), err)]
    async fn release(&self, job: &Job, worker: &str) -> Result<(), JobStoreError> {
        let history = to_json(&job.history)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = $3,
                attempts = $4,
                available_at = $5,
                lease_owner = NULL,
                lease_expires_at = NULL,
                last_error = $6,
                finished_at = $7,
                history = $8,
                updated_at = $9
            WHERE id = $1 AND state = 'active' AND lease_owner = $2
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(worker)
        .bind(job.state.as_str())
        .bind(job.attempts as i32)
        .bind(job.available_at)
        .bind(&job.last_error)
        .bind(job.finished_at)
        .bind(history)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;

        if result.rows_affected() == 0 {
            return match self.get(job.id).await? {
                Some(_) => Err(JobStoreError::LeaseLost(job.id)),
                None => Err(JobStoreError::NotFound(job.id)),
            };
        }

        // The release is committed; retention is best effort from here on.
        if job.state == JobState::Completed {
            if let Err(e) = self.trim_completed(&job.queue, job.policy.retain_completed).await {
                warn!(job_id = %job.id, queue = %job.queue, error = %e, "failed to trim completed jobs");
            }
        }
        Ok(())
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn reap_expired(&self, queue: &str, now: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = CASE WHEN attempts < max_attempts THEN 'failed' ELSE 'dead_lettered' END,
                available_at = CASE WHEN attempts < max_attempts THEN $2 ELSE available_at END,
                finished_at = CASE WHEN attempts < max_attempts THEN finished_at ELSE $2 END,
                lease_owner = NULL,
                lease_expires_at = NULL,
                last_error = 'lease expired',
                updated_at = $2
            WHERE queue = $1 AND state = 'active' AND lease_expires_at < $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(queue)
        .bind(now)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reap_expired", e))?;

        rows.iter().map(decode).collect()
    }

    async fn list(
        &self,
        queue: &str,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE queue = $1 AND ($2::text IS NULL OR state = $2)
            ORDER BY created_at ASC, seq ASC
            LIMIT $3
            "#
        ))
        .bind(queue)
        .bind(state.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(decode).collect()
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, JobStoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs WHERE queue = $1 GROUP BY state")
            .bind(queue)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let state: String = row
                .try_get("state")
                .map_err(|e| JobStoreError::Storage(format!("failed to read state: {e}")))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|e| JobStoreError::Storage(format!("failed to read count: {e}")))?;
            let n = n as usize;

            match state.parse::<JobState>().map_err(JobStoreError::Storage)? {
                JobState::Waiting => stats.waiting = n,
                JobState::Active => stats.active = n,
                JobState::Completed => stats.completed = n,
                JobState::Failed => stats.delayed = n,
                JobState::DeadLettered => stats.dead_lettered = n,
            }
        }
        Ok(stats)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, JobStoreError> {
    serde_json::to_value(value).map_err(|e| JobStoreError::Storage(format!("failed to encode: {e}")))
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to deserialize job row: {e}")))?
        .try_into()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    queue: String,
    payload: serde_json::Value,
    state: String,
    policy: serde_json::Value,
    attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    finished_at: Option<DateTime<Utc>>,
    history: serde_json::Value,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            queue: row.try_get("queue")?,
            payload: row.try_get("payload")?,
            state: row.try_get("state")?,
            policy: row.try_get("policy")?,
            attempts: row.try_get("attempts")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            available_at: row.try_get("available_at")?,
            lease_owner: row.try_get("lease_owner")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            last_error: row.try_get("last_error")?,
            finished_at: row.try_get("finished_at")?,
            history: row.try_get("history")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let policy: JobPolicy = serde_json::from_value(row.policy)
            .map_err(|e| JobStoreError::Storage(format!("invalid job policy: {e}")))?;
        let history: Vec<JobAttemptRecord> = serde_json::from_value(row.history)
            .map_err(|e| JobStoreError::Storage(format!("invalid job history: {e}")))?;

        Ok(Job {
            id: JobId::from_uuid(row.id),
            queue: row.queue,
            payload: row.payload,
            state: row.state.parse().map_err(JobStoreError::Storage)?,
            policy,
            attempts: row.attempts.max(0) as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
            available_at: row.available_at,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
            last_error: row.last_error,
            finished_at: row.finished_at,
            history,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::RetryPolicy;
    use crate::schema::testing;
    use chrono::SubsecRound;

    const LEASE: Duration = Duration::from_secs(30);

    async fn store() -> Option<PostgresJobStore> {
        testing::pool().await.map(PostgresJobStore::new)
    }

    /// Each test gets its own queue so runs can share one database.
    fn queue(prefix: &str) -> String {
        format!("{prefix}-{}", uuid::Uuid::now_v7())
    }

    /// Postgres keeps microseconds.
    fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }

    fn job(queue: &str, now: DateTime<Utc>, n: i64) -> Job {
        Job::new(queue, serde_json::json!({ "n": n }), JobPolicy::default(), now)
    }

    #[tokio::test]
    async fn claim_and_release_under_lease() {
        let Some(store) = store().await else { return };
        let q = queue("pg-claim");
        let now = now();

        let job_id = store.enqueue(job(&q, now, 1)).await.unwrap();
        assert!(matches!(
            store.enqueue(store.get(job_id).await.unwrap().unwrap()).await,
            Err(JobStoreError::AlreadyExists(id)) if id == job_id
        ));

        let mut claimed = store.claim_next(&q, "w1", LEASE, now).await.unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.lease_owner.as_deref(), Some("w1"));
        assert_eq!(claimed.lease_expires_at, Some(now + to_chrono(LEASE)));
        assert!(store.claim_next(&q, "w2", LEASE, now).await.unwrap().is_none());

        claimed.mark_completed(now, now);
        assert!(matches!(
            store.release(&claimed, "w2").await,
            Err(JobStoreError::LeaseLost(id)) if id == job_id
        ));
        store.release(&claimed, "w1").await.unwrap();
        assert!(matches!(store.release(&claimed, "w1").await, Err(JobStoreError::LeaseLost(_))));

        let done = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.lease_owner, None);
        assert_eq!(done.history.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_claims_lease_distinct_jobs() {
        let Some(store) = store().await else { return };
        let q = queue("pg-concurrent");
        let now = now();
        store.enqueue(job(&q, now, 1)).await.unwrap();
        store.enqueue(job(&q, now, 2)).await.unwrap();

        let (a, b) = tokio::join!(
            store.claim_next(&q, "w1", LEASE, now),
            store.claim_next(&q, "w2", LEASE, now),
        );
        let (a, b) = (a.unwrap().unwrap(), b.unwrap().unwrap());

        assert_ne!(a.id, b.id);
        assert_eq!(a.lease_owner.as_deref(), Some("w1"));
        assert_eq!(b.lease_owner.as_deref(), Some("w2"));
        assert!(store.claim_next(&q, "w3", LEASE, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claims_are_fifo_and_respect_delay() {
        let Some(store) = store().await else { return };
        let q = queue("pg-fifo");
        let now = now();

        let first = store.enqueue(job(&q, now, 1)).await.unwrap();
        let delayed = store
            .enqueue(job(&q, now, 2).delayed_until(now + chrono::Duration::seconds(10)))
            .await
            .unwrap();
        let third = store.enqueue(job(&q, now, 3)).await.unwrap();

        let a = store.claim_next(&q, "w", LEASE, now).await.unwrap().unwrap();
        let b = store.claim_next(&q, "w", LEASE, now).await.unwrap().unwrap();
        assert_eq!((a.id, b.id), (first, third));
        assert!(store.claim_next(&q, "w", LEASE, now).await.unwrap().is_none());

        let later = now + chrono::Duration::seconds(10);
        let c = store.claim_next(&q, "w", LEASE, later).await.unwrap().unwrap();
        assert_eq!(c.id, delayed);
    }

    #[tokio::test]
    async fn expired_leases_are_requeued_or_dead_lettered() {
        let Some(store) = store().await else { return };
        let q = queue("pg-reap");
        let now = now();

        let policy = JobPolicy {
            retry: RetryPolicy::no_retry(),
            ..Default::default()
        };
        let last_chance = store
            .enqueue(Job::new(q.as_str(), serde_json::json!({}), policy, now))
            .await
            .unwrap();
        let retryable = store.enqueue(job(&q, now, 2)).await.unwrap();

        store.claim_next(&q, "crashed", LEASE, now).await.unwrap();
        store.claim_next(&q, "crashed", LEASE, now).await.unwrap();
        assert!(store.reap_expired(&q, now).await.unwrap().is_empty());

        let later = now + chrono::Duration::seconds(31);
        let reaped = store.reap_expired(&q, later).await.unwrap();
        assert_eq!(reaped.len(), 2);

        let dl = store.get(last_chance).await.unwrap().unwrap();
        assert_eq!(dl.state, JobState::DeadLettered);
        assert_eq!(dl.finished_at, Some(later));
        assert_eq!(dl.last_error.as_deref(), Some("lease expired"));

        let again = store.get(retryable).await.unwrap().unwrap();
        assert_eq!(again.state, JobState::Failed);
        assert_eq!(again.available_at, later);
        assert_eq!(again.finished_at, None);

        let reclaimed = store.claim_next(&q, "w2", LEASE, later).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, retryable);
        assert_eq!(reclaimed.attempts, 2);
        // Dead letters are never claimed again.
        assert!(store.claim_next(&q, "w2", LEASE, later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completed_history_is_trimmed() {
        let Some(store) = store().await else { return };
        let q = queue("pg-trim");
        let mut now = now();
        let policy = JobPolicy {
            retain_completed: 2,
            ..Default::default()
        };

        let mut ids = Vec::new();
        for n in 0..4 {
            let id = store
                .enqueue(Job::new(q.as_str(), serde_json::json!({ "n": n }), policy.clone(), now))
                .await
                .unwrap();
            ids.push(id);
        }
        for _ in 0..4 {
            now += chrono::Duration::seconds(1);
            let mut j = store.claim_next(&q, "w", LEASE, now).await.unwrap().unwrap();
            j.mark_completed(now, now);
            store.release(&j, "w").await.unwrap();
        }

        let kept: Vec<_> = store
            .list(&q, Some(JobState::Completed), 10)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(kept, vec![ids[2], ids[3]]);
    }

    #[tokio::test]
    async fn failed_trim_does_not_fail_the_release() {
        let Some(store) = store().await else { return };
        let q = queue("trim-blocked");
        let now = now();

        sqlx::raw_sql(
            r#"
            CREATE OR REPLACE FUNCTION taskpulse_test_block_trim() RETURNS trigger AS $$
            BEGIN
                IF OLD.queue LIKE 'trim-blocked-%' THEN
                    RAISE EXCEPTION 'trim blocked';
                END IF;
                RETURN OLD;
            END
            $$ LANGUAGE plpgsql;
            DROP TRIGGER IF EXISTS taskpulse_test_block_trim ON jobs;
            CREATE TRIGGER taskpulse_test_block_trim BEFORE DELETE ON jobs
                FOR EACH ROW EXECUTE FUNCTION taskpulse_test_block_trim();
            "#,
        )
        .execute(&*store.pool)
        .await
        .unwrap();

        let policy = JobPolicy {
            retain_completed: 0,
            ..Default::default()
        };
        let job_id = store
            .enqueue(Job::new(q.as_str(), serde_json::json!({}), policy, now))
            .await
            .unwrap();
        let mut claimed = store.claim_next(&q, "w", LEASE, now).await.unwrap().unwrap();
        claimed.mark_completed(now, now);

        let released = store.release(&claimed, "w").await;

        sqlx::raw_sql("DROP TRIGGER IF EXISTS taskpulse_test_block_trim ON jobs")
            .execute(&*store.pool)
            .await
            .unwrap();

        released.unwrap();
        let kept = store.get(job_id).await.unwrap().unwrap();
        assert_eq!(kept.state, JobState::Completed);
    }

    #[tokio::test]
    async fn stats_count_by_state() {
        let Some(store) = store().await else { return };
        let q = queue("pg-stats");
        let now = now();

        for n in 0..5 {
            store.enqueue(job(&q, now, n)).await.unwrap();
        }
        store.claim_next(&q, "w", LEASE, now).await.unwrap();
        let mut failing = store.claim_next(&q, "w", LEASE, now).await.unwrap().unwrap();
        failing.mark_failed("timeout", false, now, now);
        store.release(&failing, "w").await.unwrap();

        let stats = store.stats(&q).await.unwrap();
        assert_eq!(stats.waiting, 3);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.depth(), 5);

        assert_eq!(store.list(&q, Some(JobState::Waiting), 10).await.unwrap().len(), 3);
        assert_eq!(store.list(&q, None, 2).await.unwrap().len(), 2);
    }
}
