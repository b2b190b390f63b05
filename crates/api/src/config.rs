//! Process configuration, read once from the environment at startup.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;

use taskpulse_infra::jobs::{JobPolicy, RetryPolicy};
use taskpulse_infra::notify::{SendGridConfig, SmtpConfig};
use taskpulse_observability::LogFormat;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
}

impl FromStr for AppEnv {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" | "local" | "test" => Ok(AppEnv::Development),
            "production" | "prod" => Ok(AppEnv::Production),
            other => Err(format!("unknown environment {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailTransport {
    Smtp,
    SendGrid,
    Memory,
}

impl FromStr for MailTransport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "smtp" => Ok(MailTransport::Smtp),
            "sendgrid" => Ok(MailTransport::SendGrid),
            "memory" => Ok(MailTransport::Memory),
            other => Err(format!("expected smtp, sendgrid or memory, got {other:?}")),
        }
    }
}

/// Transport settings after validation; only the selected one is kept.
#[derive(Debug, Clone)]
pub enum TransportSettings {
    Smtp(SmtpConfig),
    SendGrid(SendGridConfig),
    Memory,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_env: AppEnv,
    pub transport: TransportSettings,
    /// Unset means in-memory stores (dev/test only).
    pub database_url: Option<String>,
    pub bind_addr: SocketAddr,
    pub queue: String,
    pub worker_concurrency: usize,
    pub job_policy: JobPolicy,
    /// Strictly longer than `handler_timeout`.
    pub job_lease: Duration,
    pub handler_timeout: Duration,
    /// Strictly longer than `handler_timeout`; defaults to it plus 30s.
    pub workflow_lease: Duration,
    pub scan_interval: Duration,
    pub scan_batch: usize,
    pub step_retry_delay: Duration,
    pub due_date_offset: FixedOffset,
    pub log_format: LogFormat,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let app_env = env.parse_or("APP_ENV", AppEnv::Development)?;
        let default_transport = match app_env {
            AppEnv::Production => MailTransport::SendGrid,
            AppEnv::Development => MailTransport::Smtp,
        };
        let mail_transport = env.parse_or("MAIL_TRANSPORT", default_transport)?;

        let transport = match mail_transport {
            MailTransport::Memory => TransportSettings::Memory,
            MailTransport::Smtp => TransportSettings::Smtp(SmtpConfig {
                host: env.get("SMTP_HOST").unwrap_or_else(|| SmtpConfig::default().host),
                port: env.parse_or("SMTP_PORT", SmtpConfig::default().port)?,
                username: env.get("SMTP_USERNAME"),
                password: env.get("SMTP_PASSWORD"),
                sender: env.require("SENDER_EMAIL")?,
            }),
            MailTransport::SendGrid => TransportSettings::SendGrid(SendGridConfig::new(
                env.require("SENDGRID_API_KEY")?,
                env.require("SENDER_EMAIL")?,
            )),
        };

        let max_attempts: u32 = env.parse_or("JOB_MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "JOB_MAX_ATTEMPTS",
                value: "0".into(),
                reason: "at least one attempt is required".into(),
            });
        }
        let job_policy = JobPolicy {
            retry: RetryPolicy::exponential(
                max_attempts,
                Duration::from_millis(env.parse_or("JOB_BACKOFF_MS", 2000)?),
                Duration::from_secs(3600),
            ),
            retain_completed: env.parse_or("JOB_RETAIN_COMPLETED", 100)?,
            retain_failed: env.parse_or("JOB_RETAIN_FAILED", false)?,
        };

        let offset_minutes: i32 = env.parse_or("DUE_DATE_TZ_OFFSET_MINUTES", 0)?;
        let due_date_offset = offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| ConfigError::Invalid {
                var: "DUE_DATE_TZ_OFFSET_MINUTES",
                value: offset_minutes.to_string(),
                reason: "offset must be within ±24h".into(),
            })?;

        let handler_timeout = Duration::from_secs(env.parse_or("HANDLER_TIMEOUT_SECS", 30)?);
        let job_lease = Duration::from_secs(env.parse_or("JOB_LEASE_SECS", 60)?);
        outlasts_handler("JOB_LEASE_SECS", job_lease, handler_timeout)?;
        let workflow_lease = Duration::from_secs(
            env.parse_or("WORKFLOW_LEASE_SECS", handler_timeout.as_secs() + 30)?,
        );
        outlasts_handler("WORKFLOW_LEASE_SECS", workflow_lease, handler_timeout)?;

        Ok(Self {
            app_env,
            transport,
            database_url: env.get("DATABASE_URL"),
            bind_addr: env.parse_or("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            queue: env.get("QUEUE_NAME").unwrap_or_else(|| "email-queue".to_string()),
            worker_concurrency: env.parse_or("WORKER_CONCURRENCY", 2)?,
            job_policy,
            job_lease,
            handler_timeout,
            workflow_lease,
            scan_interval: Duration::from_secs(env.parse_or("WAKE_SCAN_INTERVAL_SECS", 30)?),
            scan_batch: env.parse_or("WAKE_SCAN_BATCH", 100)?,
            step_retry_delay: Duration::from_secs(env.parse_or("STEP_RETRY_SECS", 300)?),
            due_date_offset,
            log_format: env.parse_or("LOG_FORMAT", LogFormat::Json)?,
        })
    }

    pub fn transport_name(&self) -> &'static str {
        match self.transport {
            TransportSettings::Smtp(_) => "smtp",
            TransportSettings::SendGrid(_) => "sendgrid",
            TransportSettings::Memory => "memory",
        }
    }
}

/// A lease must outlive the handler call it covers.
fn outlasts_handler(var: &'static str, lease: Duration, handler_timeout: Duration) -> Result<(), ConfigError> {
    if lease > handler_timeout {
        return Ok(());
    }
    Err(ConfigError::Invalid {
        var,
        value: lease.as_secs().to_string(),
        reason: format!(
            "must be longer than HANDLER_TIMEOUT_SECS ({}s)",
            handler_timeout.as_secs()
        ),
    })
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Value of `var`, treating an empty string as unset.
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var).filter(|v| !v.trim().is_empty())
    }

    fn require(&self, var: &'static str) -> Result<String, ConfigError> {
        self.get(var).ok_or(ConfigError::Missing(var))
    }

    fn parse_or<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: core::fmt::Display,
    {
        match self.get(var) {
            None => Ok(default),
            Some(value) => match value.trim().parse() {
                Ok(parsed) => Ok(parsed),
                Err(e) => Err(ConfigError::Invalid {
                    var,
                    reason: e.to_string(),
                    value,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_for_development() {
        let cfg = config(&[("SENDER_EMAIL", "noreply@example.com")]).unwrap();

        assert_eq!(cfg.app_env, AppEnv::Development);
        assert_eq!(cfg.transport_name(), "smtp");
        assert_eq!(cfg.queue, "email-queue");
        assert_eq!(cfg.worker_concurrency, 2);
        assert_eq!(cfg.job_policy.max_attempts(), 3);
        assert_eq!(cfg.job_policy.retry.base_delay, Duration::from_millis(2000));
        assert_eq!(cfg.job_policy.retain_completed, 100);
        assert!(!cfg.job_policy.retain_failed);
        assert_eq!(cfg.scan_interval, Duration::from_secs(30));
        assert_eq!(cfg.scan_batch, 100);
        assert_eq!(cfg.step_retry_delay, Duration::from_secs(300));
        assert_eq!(cfg.bind_addr.port(), 8080);
        assert_eq!(cfg.job_lease, Duration::from_secs(60));
        assert_eq!(cfg.handler_timeout, Duration::from_secs(30));
        assert_eq!(cfg.workflow_lease, Duration::from_secs(60));
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert!(cfg.database_url.is_none());

        let TransportSettings::Smtp(smtp) = cfg.transport else {
            panic!("expected smtp settings");
        };
        assert_eq!(smtp.host, "smtp.gmail.com");
        assert_eq!(smtp.port, 465);
    }

    #[test]
    fn production_selects_sendgrid() {
        let cfg = config(&[
            ("APP_ENV", "production"),
            ("SENDER_EMAIL", "noreply@example.com"),
            ("SENDGRID_API_KEY", "SG.key"),
        ])
        .unwrap();
        assert_eq!(cfg.transport_name(), "sendgrid");
    }

    #[test]
    fn sendgrid_requires_api_key() {
        let err = config(&[("APP_ENV", "production"), ("SENDER_EMAIL", "noreply@example.com")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("SENDGRID_API_KEY"));
    }

    #[test]
    fn memory_transport_needs_no_sender() {
        let cfg = config(&[("MAIL_TRANSPORT", "memory")]).unwrap();
        assert_eq!(cfg.transport_name(), "memory");
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = config(&[("MAIL_TRANSPORT", "memory"), ("WORKER_CONCURRENCY", "many")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "WORKER_CONCURRENCY", .. }));

        let err = config(&[("MAIL_TRANSPORT", "carrier-pigeon")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "MAIL_TRANSPORT", .. }));

        let err = config(&[("MAIL_TRANSPORT", "memory"), ("JOB_MAX_ATTEMPTS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "JOB_MAX_ATTEMPTS", .. }));
    }

    #[test]
    fn due_date_offset_in_minutes() {
        let cfg = config(&[("MAIL_TRANSPORT", "memory"), ("DUE_DATE_TZ_OFFSET_MINUTES", "-300")]).unwrap();
        assert_eq!(cfg.due_date_offset.local_minus_utc(), -300 * 60);
    }

    #[test]
    fn leases_must_outlast_the_handler_timeout() {
        let err = config(&[
            ("MAIL_TRANSPORT", "memory"),
            ("HANDLER_TIMEOUT_SECS", "120"),
            ("WORKFLOW_LEASE_SECS", "300"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "JOB_LEASE_SECS", .. }));

        let err = config(&[
            ("MAIL_TRANSPORT", "memory"),
            ("JOB_LEASE_SECS", "30"),
            ("HANDLER_TIMEOUT_SECS", "30"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "JOB_LEASE_SECS", .. }));

        let err = config(&[("MAIL_TRANSPORT", "memory"), ("WORKFLOW_LEASE_SECS", "20")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "WORKFLOW_LEASE_SECS", .. }));

        // The workflow lease follows a longer timeout by default.
        let cfg = config(&[
            ("MAIL_TRANSPORT", "memory"),
            ("HANDLER_TIMEOUT_SECS", "120"),
            ("JOB_LEASE_SECS", "180"),
        ])
        .unwrap();
        assert_eq!(cfg.workflow_lease, Duration::from_secs(150));
    }
}
