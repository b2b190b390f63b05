//! Tables backing the Postgres job and workflow stores.

use sqlx::PgPool;
use tracing::info;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    seq              BIGSERIAL,
    id               UUID PRIMARY KEY,
    queue            TEXT NOT NULL,
    payload          JSONB NOT NULL,
    state            TEXT NOT NULL,
    policy           JSONB NOT NULL,
    max_attempts     INTEGER NOT NULL,
    attempts         INTEGER NOT NULL DEFAULT 0,
    created_at       TIMESTAMPTZ NOT NULL,
    updated_at       TIMESTAMPTZ NOT NULL,
    available_at     TIMESTAMPTZ NOT NULL,
    lease_owner      TEXT,
    lease_expires_at TIMESTAMPTZ,
    last_error       TEXT,
    finished_at      TIMESTAMPTZ,
    history          JSONB NOT NULL DEFAULT '[]'::jsonb,
    CHECK (attempts <= max_attempts)
);

CREATE INDEX IF NOT EXISTS jobs_claim_idx
    ON jobs (queue, available_at, seq)
    WHERE state IN ('waiting', 'failed');

CREATE INDEX IF NOT EXISTS jobs_lease_idx
    ON jobs (queue, lease_expires_at)
    WHERE state = 'active';

CREATE INDEX IF NOT EXISTS jobs_state_idx ON jobs (queue, state);

CREATE TABLE IF NOT EXISTS workflow_instances (
    id               UUID PRIMARY KEY,
    task_id          UUID NOT NULL,
    origin           TEXT NOT NULL,
    state            TEXT NOT NULL,
    wake_at          TIMESTAMPTZ,
    lease_owner      TEXT,
    lease_expires_at TIMESTAMPTZ,
    created_at       TIMESTAMPTZ NOT NULL,
    updated_at       TIMESTAMPTZ NOT NULL,
    last_error       TEXT
);

CREATE INDEX IF NOT EXISTS workflow_instances_task_idx ON workflow_instances (task_id);

CREATE INDEX IF NOT EXISTS workflow_instances_wake_idx
    ON workflow_instances (wake_at)
    WHERE state IN ('running', 'sleeping');

CREATE TABLE IF NOT EXISTS workflow_steps (
    instance_id UUID NOT NULL REFERENCES workflow_instances (id) ON DELETE CASCADE,
    step        TEXT NOT NULL,
    completed   BOOLEAN NOT NULL,
    result      JSONB NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (instance_id, step)
);
"#;

/// Create the pipeline tables if they do not exist yet. Idempotent.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("pipeline schema ready");
    Ok(())
}
