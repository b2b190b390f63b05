//! Durable job queue with retry, backoff, and dead-letter handling.
//!
//! ## Components
//!
//! - `Job`: payload plus lifecycle state, attempt count and lease
//! - `JobStore`: persistence (in-memory for tests/dev, Postgres for production)
//! - `JobExecutor`: worker pool that leases jobs and runs a `JobHandler`
//!
//! Delivery is at-least-once: a job whose worker dies mid-flight is reaped
//! after its lease expires and handed to another worker.

pub mod executor;
pub mod postgres;
pub mod store;
pub mod types;

pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobHandler, JobOutcome};
pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError, QueueStats};
pub use types::{
    BackoffStrategy, FailureDisposition, Job, JobAttemptRecord, JobPolicy, JobResult, JobState, RetryPolicy,
};
