//! Postgres-backed workflow store.
//!
//! Two tables: `workflow_instances` (one row per instance, a single `wake_at`
//! column) and `workflow_steps` keyed by `(instance_id, step)`. A sleeping
//! instance is just a row; the wake scanner finds it through the partial
//! index on `wake_at`.
//!
//! Transitions:
//!
//! - lease: `UPDATE … WHERE <due> AND <lease free> RETURNING`
//! - memo: lock the instance row while `owner`'s lease is live, then
//!   `INSERT … ON CONFLICT (instance_id, step) DO NOTHING`
//! - sleep/complete: `UPDATE … WHERE state = 'running' AND lease_owner = $owner
//!   AND lease_expires_at >= $now`

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use taskpulse_core::{InstanceId, TaskId};

use super::store::{WorkflowStore, WorkflowStoreError};
use super::types::{StepMemo, WorkflowInstance};
use crate::jobs::types::to_chrono;

const INSTANCE_COLUMNS: &str = r#"
    id, task_id, origin, state, wake_at, lease_owner, lease_expires_at,
    created_at, updated_at, last_error
"#;

#[derive(Debug, Clone)]
pub struct PostgresWorkflowStore {
    pool: Arc<PgPool>,
}

impl PostgresWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn load_steps(&self, id: InstanceId) -> Result<BTreeMap<String, StepMemo>, WorkflowStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT step, completed, result, recorded_at
            FROM workflow_steps
            WHERE instance_id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_steps", e))?;

        let mut memo = BTreeMap::new();
        for row in rows {
            let step = StepRow::from_row(&row)
                .map_err(|e| WorkflowStoreError::Storage(format!("failed to deserialize step row: {e}")))?;
            memo.insert(
                step.step.clone(),
                StepMemo {
                    step: step.step,
                    completed: step.completed,
                    result: step.result,
                    recorded_at: step.recorded_at,
                },
            );
        }
        Ok(memo)
    }

    async fn hydrate(&self, row: &sqlx::postgres::PgRow) -> Result<WorkflowInstance, WorkflowStoreError> {
        let row = InstanceRow::from_row(row)
            .map_err(|e| WorkflowStoreError::Storage(format!("failed to deserialize instance row: {e}")))?;
        let memo = self.load_steps(InstanceId::from_uuid(row.id)).await?;
        row.into_instance(memo)
    }

    /// Distinguish a lost lease from a missing row after a CAS miss.
    async fn cas_miss(&self, id: InstanceId) -> WorkflowStoreError {
        match self.exists(id).await {
            Ok(true) => WorkflowStoreError::LeaseLost(id),
            Ok(false) => WorkflowStoreError::NotFound(id),
            Err(e) => e,
        }
    }

    async fn exists(&self, id: InstanceId) -> Result<bool, WorkflowStoreError> {
        let row = sqlx::query("SELECT 1 AS one FROM workflow_instances WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("exists", e))?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self, instance), fields(instance_id = %instance.id, task_id = %instance.task_id), err)]
    async fn create(&self, instance: WorkflowInstance) -> Result<(), WorkflowStoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_instances (
                id, task_id, origin, state, wake_at, lease_owner, lease_expires_at,
                created_at, updated_at, last_error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(instance.id.as_uuid())
        .bind(instance.task_id.as_uuid())
        .bind(&instance.origin)
        .bind(instance.state.as_str())
        .bind(instance.wake_at)
        .bind(&instance.lease_owner)
        .bind(instance.lease_expires_at)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .bind(&instance.last_error)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                WorkflowStoreError::AlreadyExists(instance.id)
            } else {
                map_sqlx_error("create", e)
            }
        })?;

        Ok(())
    }

    async fn get(&self, id: InstanceId) -> Result<Option<WorkflowInstance>, WorkflowStoreError> {
        let row = sqlx::query(&format!("SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        match row {
            Some(row) => Ok(Some(self.hydrate(&row).await?)),
            None => Ok(None),
        }
    }

    async fn find_by_task(&self, task_id: TaskId) -> Result<Vec<WorkflowInstance>, WorkflowStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE task_id = $1 ORDER BY created_at ASC, id ASC"
        ))
        .bind(task_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_task", e))?;

        let mut instances = Vec::with_capacity(rows.len());
        for row in &rows {
            instances.push(self.hydrate(row).await?);
        }
        Ok(instances)
    }

    #[instrument(skip(self, lease), fields(instance_id = %id, owner = %owner), err)]
    async fn try_lease(
        &self,
        id: InstanceId,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkflowInstance>, WorkflowStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE workflow_instances
            SET state = 'running',
                lease_owner = $2,
                lease_expires_at = $3,
                updated_at = $4
            WHERE id = $1
              AND (lease_expires_at IS NULL OR lease_expires_at < $4)
              AND ((state = 'sleeping' AND wake_at <= $4) OR state = 'running')
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(owner)
        .bind(now + to_chrono(lease))
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_lease", e))?;

        match row {
            Some(row) => Ok(Some(self.hydrate(&row).await?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, memo), fields(instance_id = %id, step = %memo.step), err)]
    async fn record_step(
        &self,
        id: InstanceId,
        owner: &str,
        memo: StepMemo,
        now: DateTime<Utc>,
    ) -> Result<bool, WorkflowStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("record_step", e))?;

        // Row lock: a takeover through `try_lease` waits until the memo is in.
        let live = sqlx::query(
            r#"
            SELECT 1 AS one FROM workflow_instances
            WHERE id = $1 AND state = 'running' AND lease_owner = $2 AND lease_expires_at >= $3
            FOR UPDATE
            "#,
        )
        .bind(id.as_uuid())
        .bind(owner)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("record_step", e))?;

        if live.is_none() {
            drop(tx);
            return Err(self.cas_miss(id).await);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO workflow_steps (instance_id, step, completed, result, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (instance_id, step) DO NOTHING
            "#,
        )
        .bind(id.as_uuid())
        .bind(&memo.step)
        .bind(memo.completed)
        .bind(&memo.result)
        .bind(memo.recorded_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("record_step", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("record_step", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, last_error), fields(instance_id = %id, wake_at = %wake_at), err)]
    async fn sleep_until(
        &self,
        id: InstanceId,
        owner: &str,
        wake_at: DateTime<Utc>,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, WorkflowStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET state = 'sleeping',
                wake_at = GREATEST(COALESCE(wake_at, $3), $3),
                lease_owner = NULL,
                lease_expires_at = NULL,
                last_error = $4,
                updated_at = $5
            WHERE id = $1 AND state = 'running' AND lease_owner = $2 AND lease_expires_at >= $5
            RETURNING wake_at
            "#,
        )
        .bind(id.as_uuid())
        .bind(owner)
        .bind(wake_at)
        .bind(last_error)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("sleep_until", e))?;

        match row {
            Some(row) => row
                .try_get("wake_at")
                .map_err(|e| WorkflowStoreError::Storage(format!("failed to read wake_at: {e}"))),
            None => Err(self.cas_miss(id).await),
        }
    }

    #[instrument(skip(self), fields(instance_id = %id), err)]
    async fn complete(&self, id: InstanceId, owner: &str, now: DateTime<Utc>) -> Result<(), WorkflowStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET state = 'completed',
                lease_owner = NULL,
                lease_expires_at = NULL,
                last_error = NULL,
                updated_at = $3
            WHERE id = $1 AND state = 'running' AND lease_owner = $2 AND lease_expires_at >= $3
            "#,
        )
        .bind(id.as_uuid())
        .bind(owner)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        if result.rows_affected() == 0 {
            return Err(self.cas_miss(id).await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(instance_id = %id), err)]
    async fn cancel(&self, id: InstanceId, reason: &str, now: DateTime<Utc>) -> Result<bool, WorkflowStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_instances
            SET state = 'cancelled',
                lease_owner = NULL,
                lease_expires_at = NULL,
                last_error = $2,
                updated_at = $3
            WHERE id = $1 AND state IN ('running', 'sleeping')
            "#,
        )
        .bind(id.as_uuid())
        .bind(reason)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cancel", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if self.exists(id).await? {
            Ok(false)
        } else {
            Err(WorkflowStoreError::NotFound(id))
        }
    }

    async fn due_for_wake(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<InstanceId>, WorkflowStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM workflow_instances
            WHERE (lease_expires_at IS NULL OR lease_expires_at < $1)
              AND ((state = 'sleeping' AND wake_at <= $1) OR state = 'running')
            ORDER BY COALESCE(wake_at, updated_at) ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("due_for_wake", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<uuid::Uuid, _>("id")
                    .map(InstanceId::from_uuid)
                    .map_err(|e| WorkflowStoreError::Storage(format!("failed to read id: {e}")))
            })
            .collect()
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> WorkflowStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            WorkflowStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => WorkflowStoreError::Storage(format!("connection pool closed in {}", operation)),
        _ => WorkflowStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn db_code(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
        _ => None,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    db_code(err).as_deref() == Some("23505")
}

// SQLx row types

#[derive(Debug)]
struct InstanceRow {
    id: uuid::Uuid,
    task_id: uuid::Uuid,
    origin: String,
    state: String,
    wake_at: Option<DateTime<Utc>>,
    lease_owner: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_error: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for InstanceRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(InstanceRow {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            origin: row.try_get("origin")?,
            state: row.try_get("state")?,
            wake_at: row.try_get("wake_at")?,
            lease_owner: row.try_get("lease_owner")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

impl InstanceRow {
    fn into_instance(self, memo: BTreeMap<String, StepMemo>) -> Result<WorkflowInstance, WorkflowStoreError> {
        Ok(WorkflowInstance {
            id: InstanceId::from_uuid(self.id),
            task_id: TaskId::from_uuid(self.task_id),
            origin: self.origin,
            state: self.state.parse().map_err(WorkflowStoreError::Storage)?,
            wake_at: self.wake_at,
            memo,
            lease_owner: self.lease_owner,
            lease_expires_at: self.lease_expires_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_error: self.last_error,
        })
    }
}

#[derive(Debug)]
struct StepRow {
    step: String,
    completed: bool,
    result: serde_json::Value,
    recorded_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StepRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StepRow {
            step: row.try_get("step")?,
            completed: row.try_get("completed")?,
            result: row.try_get("result")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}
