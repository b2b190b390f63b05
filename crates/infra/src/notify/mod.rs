//! Notification dispatch: one `Transport` trait, one implementation chosen at
//! startup, and a `Dispatcher` that renders the two task notices.
//!
//! The dispatcher makes exactly one transport call per invocation. Retrying
//! belongs to the caller (job queue or workflow engine), so a dispatcher call
//! is neither retried nor idempotent.

pub mod memory;
pub mod sendgrid;
pub mod smtp;
pub mod templates;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use taskpulse_core::TaskSnapshot;

pub use memory::MemoryTransport;
pub use sendgrid::{SendGridConfig, SendGridTransport};
pub use smtp::{SmtpConfig, SmtpTransport};

/// A rendered message ready for a transport. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub to: String,
    pub subject: String,
    pub body_html: String,
    /// Ties transport logs back to the job or workflow step that sent it.
    pub correlation_id: String,
}

/// Provider-assigned (or locally generated) message id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl core::fmt::Display for MessageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport failure, classified for the retry decision.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Network error, timeout, provider 5xx/429. Worth retrying.
    #[error("transient transport failure: {0}")]
    Transient(String),
    /// Bad recipient, rejected credentials, provider 4xx. Retrying cannot help.
    #[error("permanent transport failure: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::Permanent(_))
    }

    /// Classify an HTTP status returned by a mail provider.
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = format!("HTTP {status}: {}", detail.into());
        match status {
            408 | 429 => Self::Transient(detail),
            400..=499 => Self::Permanent(detail),
            _ => Self::Transient(detail),
        }
    }
}

/// Email transport abstraction.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs ("smtp", "sendgrid", "memory").
    fn name(&self) -> &'static str;

    async fn send(&self, request: &NotificationRequest) -> Result<MessageId, TransportError>;
}

/// Renders task notices and hands them to the configured transport.
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    offset: FixedOffset,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: Duration::from_secs(30),
            offset: templates::utc(),
        }
    }

    /// Bound every transport call; an elapsed timeout is a transient failure.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Calendar used to print due dates.
    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Upper bound of a single `send`.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[instrument(skip(self, body_html), fields(transport = self.transport.name()), err)]
    pub async fn send(
        &self,
        to: &str,
        subject: &str,
        body_html: &str,
        correlation_id: &str,
    ) -> Result<MessageId, TransportError> {
        let request = NotificationRequest {
            to: to.to_string(),
            subject: subject.to_string(),
            body_html: body_html.to_string(),
            correlation_id: correlation_id.to_string(),
        };

        let id = tokio::time::timeout(self.timeout, self.transport.send(&request))
            .await
            .map_err(|_| {
                TransportError::transient(format!("transport timed out after {}ms", self.timeout.as_millis()))
            })??;

        debug!(message_id = %id, "notification sent");
        Ok(id)
    }

    /// Send the "new task assigned" notice to the task's assignee.
    pub async fn send_assignment(
        &self,
        task: &TaskSnapshot,
        origin: &str,
        correlation_id: &str,
    ) -> Result<MessageId, TransportError> {
        let to = recipient(task)?;
        let notice = templates::assignment(task, origin, self.offset);
        self.send(to, &notice.subject, &notice.body_html, correlation_id).await
    }

    /// Send the due-date reminder to the task's assignee.
    pub async fn send_reminder(
        &self,
        task: &TaskSnapshot,
        origin: &str,
        correlation_id: &str,
    ) -> Result<MessageId, TransportError> {
        let to = recipient(task)?;
        let notice = templates::reminder(task, origin, self.offset);
        self.send(to, &notice.subject, &notice.body_html, correlation_id).await
    }
}

fn recipient(task: &TaskSnapshot) -> Result<&str, TransportError> {
    task.recipient()
        .filter(|to| !to.trim().is_empty())
        .ok_or_else(|| TransportError::permanent(format!("task {} has no assignee email", task.id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskpulse_core::{Assignee, ProjectRef, TaskId, TaskStatus};

    fn task(assignee: Option<Assignee>) -> TaskSnapshot {
        TaskSnapshot {
            id: TaskId::new(),
            title: "Ship release".into(),
            description: "Tag and publish".into(),
            status: TaskStatus::Todo,
            due_date: None,
            project: ProjectRef { name: "Apollo".into() },
            assignee,
        }
    }

    #[test]
    fn http_status_classification() {
        assert!(TransportError::from_status(400, "bad").is_permanent());
        assert!(TransportError::from_status(401, "unauthorized").is_permanent());
        assert!(!TransportError::from_status(408, "timeout").is_permanent());
        assert!(!TransportError::from_status(429, "slow down").is_permanent());
        assert!(!TransportError::from_status(503, "unavailable").is_permanent());
    }

    #[tokio::test]
    async fn assignment_goes_to_assignee() {
        let transport = Arc::new(MemoryTransport::new());
        let dispatcher = Dispatcher::new(transport.clone());
        let t = task(Some(Assignee {
            name: "Sam".into(),
            email: "sam@example.com".into(),
        }));

        dispatcher.send_assignment(&t, "https://app.example.com", "job-1").await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "sam@example.com");
        assert_eq!(sent[0].subject, "New Task Assigned in Apollo");
        assert_eq!(sent[0].correlation_id, "job-1");
    }

    #[tokio::test]
    async fn missing_assignee_is_permanent() {
        let transport = Arc::new(MemoryTransport::new());
        let dispatcher = Dispatcher::new(transport.clone());

        let err = dispatcher.send_reminder(&task(None), "", "x").await.unwrap_err();
        assert!(err.is_permanent());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn slow_transport_times_out_as_transient() {
        let transport = Arc::new(MemoryTransport::new().with_latency(Duration::from_secs(5)));
        let dispatcher = Dispatcher::new(transport).with_timeout(Duration::from_millis(10));

        let err = dispatcher.send("a@example.com", "s", "b", "c").await.unwrap_err();
        assert!(matches!(err, TransportError::Transient(ref m) if m.contains("timed out")));
    }
}
