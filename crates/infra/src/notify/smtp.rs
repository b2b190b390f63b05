//! SMTP transport (development / self-hosted relays).

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{MessageId, NotificationRequest, Transport, TransportError};

/// SMTP relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    /// 465 uses implicit TLS, anything else STARTTLS.
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub sender: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "smtp.gmail.com".to_string(),
            port: 465,
            username: None,
            password: None,
            sender: String::new(),
        }
    }
}

pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
}

impl SmtpTransport {
    pub fn new(config: &SmtpConfig) -> Result<Self, TransportError> {
        let sender: Mailbox = config
            .sender
            .parse()
            .map_err(|e| TransportError::permanent(format!("invalid sender address: {e}")))?;

        let builder = if config.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
        }
        .map_err(|e| TransportError::permanent(format!("SMTP relay: {e}")))?
        .port(config.port);

        let builder = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => builder.credentials(Credentials::new(user.clone(), pass.clone())),
            _ => builder,
        };

        info!(host = %config.host, port = config.port, "SMTP transport configured");
        Ok(Self {
            mailer: builder.build(),
            sender,
        })
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn send(&self, request: &NotificationRequest) -> Result<MessageId, TransportError> {
        let to: Mailbox = request
            .to
            .parse()
            .map_err(|e| TransportError::permanent(format!("invalid recipient {}: {e}", request.to)))?;

        let message_id = format!("<{}@taskpulse>", request.correlation_id);
        let email = Message::builder()
            .from(self.sender.clone())
            .to(to)
            .subject(request.subject.as_str())
            .message_id(Some(message_id.clone()))
            .header(ContentType::TEXT_HTML)
            .body(request.body_html.clone())
            .map_err(|e| TransportError::permanent(format!("build email: {e}")))?;

        self.mailer.send(email).await.map_err(|e| {
            if e.is_permanent() {
                TransportError::permanent(format!("SMTP send: {e}"))
            } else {
                TransportError::transient(format!("SMTP send: {e}"))
            }
        })?;

        Ok(MessageId(message_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_sender_is_rejected_up_front() {
        let config = SmtpConfig {
            sender: "not an address".into(),
            ..Default::default()
        };
        assert!(matches!(SmtpTransport::new(&config), Err(TransportError::Permanent(_))));
    }

    #[tokio::test]
    async fn invalid_recipient_is_permanent() {
        let transport = SmtpTransport::new(&SmtpConfig {
            host: "localhost".into(),
            port: 2525,
            sender: "noreply@example.com".into(),
            ..Default::default()
        })
        .unwrap();

        let err = transport
            .send(&NotificationRequest {
                to: "nobody".into(),
                subject: "s".into(),
                body_html: "b".into(),
                correlation_id: "c".into(),
            })
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }
}
