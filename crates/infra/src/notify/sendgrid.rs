//! SendGrid v3 HTTP transport (hosted / production).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{MessageId, NotificationRequest, Transport, TransportError};

const DEFAULT_ENDPOINT: &str = "https://api.sendgrid.com/v3/mail/send";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendGridConfig {
    pub api_key: String,
    /// Must be a verified sender in SendGrid.
    pub sender: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_timeout() -> u64 {
    30
}

impl SendGridConfig {
    pub fn new(api_key: impl Into<String>, sender: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            sender: sender.into(),
            endpoint: default_endpoint(),
            timeout_secs: default_timeout(),
        }
    }
}

pub struct SendGridTransport {
    config: SendGridConfig,
    client: Client,
}

impl SendGridTransport {
    pub fn new(config: SendGridConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TransportError::permanent(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    fn payload(&self, request: &NotificationRequest) -> serde_json::Value {
        json!({
            "personalizations": [{ "to": [{ "email": request.to }] }],
            "from": { "email": self.config.sender },
            "subject": request.subject,
            "content": [{ "type": "text/html", "value": request.body_html }],
            "custom_args": { "correlation_id": request.correlation_id },
        })
    }
}

#[async_trait]
impl Transport for SendGridTransport {
    fn name(&self) -> &'static str {
        "sendgrid"
    }

    async fn send(&self, request: &NotificationRequest) -> Result<MessageId, TransportError> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&self.payload(request))
            .send()
            .await
            .map_err(|e| TransportError::transient(format!("SendGrid request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status.as_u16(), detail));
        }

        let id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| request.correlation_id.clone());

        Ok(MessageId(id))
    }
}
