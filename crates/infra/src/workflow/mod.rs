//! Durable, resumable per-task workflows.
//!
//! Instances and their step memo live in a [`WorkflowStore`]; the
//! [`WorkflowEngine`] drives one instance at a time under a lease, and the
//! [`WakeScanner`] resumes sleeping instances once their `wake_at` passes.

pub mod engine;
pub mod postgres;
pub mod scanner;
pub mod store;
pub mod types;

pub use engine::{ResumeOutcome, WorkflowConfig, WorkflowEngine, WorkflowError};
pub use postgres::PostgresWorkflowStore;
pub use scanner::{WakeScanner, WakeScannerConfig, WakeScannerHandle};
pub use store::{InMemoryWorkflowStore, WorkflowStore, WorkflowStoreError};
pub use types::{InstanceState, StepMemo, WorkflowInstance, steps};
