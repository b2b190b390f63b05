//! `taskpulse-core` — identifiers and the task view shared by the pipeline.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod task;

pub use error::{DomainError, DomainResult};
pub use id::{InstanceId, JobId, TaskId};
pub use task::{Assignee, ProjectRef, TaskSnapshot, TaskStatus};
