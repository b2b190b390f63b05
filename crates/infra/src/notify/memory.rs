//! Recording transport for tests and dry runs.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{MessageId, NotificationRequest, Transport, TransportError};

#[derive(Debug, Default)]
struct State {
    sent: Vec<NotificationRequest>,
    attempts: usize,
    /// Outcomes to return before falling back to success, front first.
    script: VecDeque<TransportError>,
}

/// Keeps every successfully "sent" request in memory.
///
/// Failures can be scripted with [`fail_next`](Self::fail_next); a failed
/// call is counted as an attempt but not recorded as sent.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
    latency: Option<Duration>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every `send`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue a failure for the next call that is not already scripted.
    pub fn fail_next(&self, error: TransportError) {
        self.lock().script.push_back(error);
    }

    pub fn sent(&self) -> Vec<NotificationRequest> {
        self.lock().sent.clone()
    }

    /// Sent requests whose subject starts with `prefix`.
    pub fn sent_with_subject(&self, prefix: &str) -> Vec<NotificationRequest> {
        self.lock()
            .sent
            .iter()
            .filter(|r| r.subject.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Every call, successful or not.
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn send(&self, request: &NotificationRequest) -> Result<MessageId, TransportError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        state.attempts += 1;
        if let Some(error) = state.script.pop_front() {
            return Err(error);
        }

        state.sent.push(request.clone());
        Ok(MessageId(format!("memory-{}", state.sent.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> NotificationRequest {
        NotificationRequest {
            to: "sam@example.com".into(),
            subject: "Hello".into(),
            body_html: "<p>hi</p>".into(),
            correlation_id: "c-1".into(),
        }
    }

    #[tokio::test]
    async fn scripted_failures_come_first() {
        let transport = MemoryTransport::new();
        transport.fail_next(TransportError::transient("connection reset"));

        assert!(transport.send(&request()).await.is_err());
        let id = transport.send(&request()).await.unwrap();

        assert_eq!(id, MessageId("memory-1".into()));
        assert_eq!(transport.attempts(), 2);
        assert_eq!(transport.sent().len(), 1);
    }
}
