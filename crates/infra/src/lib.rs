//! Infrastructure layer: job queue, workflow engine, notification transports
//! and their Postgres adapters.

pub mod jobs;
pub mod notify;
pub mod pipeline;
pub mod schema;
pub mod signals;
pub mod tasks;
pub mod workflow;

pub use pipeline::{AssignmentHandler, AssignmentPayload, AssignmentReceipt, Pipeline, PipelineError};
pub use signals::SignalBus;
