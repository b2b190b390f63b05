use axum::{routing::get, Router};

pub mod events;
pub mod queues;
pub mod system;
pub mod workflows;

/// Read-only inspection routes plus the task-event ingress.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/queues/:queue/stats", get(queues::stats))
        .route("/queues/:queue/jobs", get(queues::list_jobs))
        .route("/queues/:queue/dead-letters", get(queues::dead_letters))
        .route("/jobs/:id", get(queues::get_job))
        .route("/workflows", get(workflows::list_instances))
        .route("/workflows/:id", get(workflows::get_instance))
        .nest("/events", events::router())
}
