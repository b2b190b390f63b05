//! Task source reading the task service's own tables.
//!
//! The task service owns the `"Task"`, `"Project"` and `"User"` tables (quoted,
//! camel-cased as its ORM creates them). This adapter only ever reads.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use taskpulse_core::{Assignee, ProjectRef, TaskId, TaskSnapshot};

use super::{TaskSource, TaskSourceError};

#[derive(Debug, Clone)]
pub struct PostgresTaskSource {
    pool: Arc<PgPool>,
}

impl PostgresTaskSource {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl TaskSource for PostgresTaskSource {
    #[instrument(skip(self), fields(task_id = %task_id), err)]
    async fn fetch(&self, task_id: TaskId) -> Result<Option<TaskSnapshot>, TaskSourceError> {
        let row = sqlx::query(
            r#"
            SELECT
                t."title"       AS title,
                t."description" AS description,
                t."status"::text AS status,
                t."due_date" AT TIME ZONE 'UTC' AS due_date,
                p."name"        AS project_name,
                u."name"        AS assignee_name,
                u."email"       AS assignee_email
            FROM "Task" t
            JOIN "Project" p ON p."id" = t."projectId"
            LEFT JOIN "User" u ON u."id" = t."assigneeId"
            WHERE t."id" = $1
            "#,
        )
        .bind(task_id.to_string())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| TaskSourceError::Unavailable(format!("fetch task: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let row = TaskRow::from_row(&row).map_err(|e| TaskSourceError::InvalidRecord(task_id, e.to_string()))?;
        row.into_snapshot(task_id).map(Some)
    }
}

#[derive(Debug)]
struct TaskRow {
    title: String,
    description: Option<String>,
    status: String,
    due_date: Option<DateTime<Utc>>,
    project_name: String,
    assignee_name: Option<String>,
    assignee_email: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for TaskRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskRow {
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            status: row.try_get("status")?,
            due_date: row.try_get("due_date")?,
            project_name: row.try_get("project_name")?,
            assignee_name: row.try_get("assignee_name")?,
            assignee_email: row.try_get("assignee_email")?,
        })
    }
}

impl TaskRow {
    fn into_snapshot(self, id: TaskId) -> Result<TaskSnapshot, TaskSourceError> {
        let status = self
            .status
            .parse()
            .map_err(|e: taskpulse_core::DomainError| TaskSourceError::InvalidRecord(id, e.to_string()))?;

        let assignee = match (self.assignee_name, self.assignee_email) {
            (name, Some(email)) => Some(Assignee {
                name: name.unwrap_or_default(),
                email,
            }),
            _ => None,
        };

        Ok(TaskSnapshot {
            id,
            title: self.title,
            description: self.description.unwrap_or_default(),
            status,
            due_date: self.due_date,
            project: ProjectRef {
                name: self.project_name,
            },
            assignee,
        })
    }
}
