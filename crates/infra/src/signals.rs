//! Fan-out of [`PipelineSignal`]s from the queue and the workflow engine.

use std::sync::Arc;

use taskpulse_events::{EventBus, InMemoryEventBus, PipelineSignal};

/// Shared signal bus handed to executors, the workflow engine and the API.
pub type SignalBus = Arc<InMemoryEventBus<PipelineSignal>>;

/// Publish a signal, logging (not propagating) a failed publish.
///
/// The state change being announced is already committed by the time this
/// runs, so a publish failure never rolls anything back.
pub(crate) fn emit(bus: Option<&SignalBus>, signal: PipelineSignal) {
    let Some(bus) = bus else {
        return;
    };
    if let Err(e) = bus.publish(signal) {
        tracing::warn!(error = ?e, "failed to publish pipeline signal");
    }
}
