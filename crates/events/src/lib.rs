//! Events flowing into and out of the notification pipeline.
//!
//! - [`task`]: producer events emitted by the task service (ingress)
//! - [`signal`]: operational signals emitted by the pipeline (egress)
//! - [`bus`]: transport-agnostic pub/sub used to fan signals out

pub mod bus;
pub mod in_memory_bus;
pub mod signal;
pub mod task;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use signal::PipelineSignal;
pub use task::{TaskAssigned, TaskDeleted};
