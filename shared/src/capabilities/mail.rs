use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MailError {
    #[error("invalid message: {reason}")]
    InvalidMessage { reason: String },

    #[error("mail transport failed: {message}")]
    Transport { message: String },

    #[error("mail provider refused message ({status}): {message}")]
    Refused { status: u16, message: String },
}

#[async_trait::async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), MailError>;
}

impl EmailMessage {
    pub fn validate(&self) -> Result<(), MailError> {
        for (field, value) in [("from", &self.from), ("to", &self.to), ("subject", &self.subject)] {
            if value.trim().is_empty() {
                return Err(MailError::InvalidMessage {
                    reason: format!("{field} must not be empty"),
                });
            }
        }
        if !self.to.contains('@') {
            return Err(MailError::InvalidMessage {
                reason: format!("'{}' is not an email address", self.to),
            });
        }
        Ok(())
    }
}

#[cfg(feature = "http")]
pub use self::resend::{ResendConfig, ResendMailer};

#[cfg(feature = "http")]
mod resend {
    use super::{EmailMessage, MailError, Mailer, RESEND_ENDPOINT};
    use secrecy::{ExposeSecret, SecretString};
    use tracing::{info, instrument, warn};

    #[derive(Debug, Clone)]
    pub struct ResendConfig {
        pub api_key: SecretString,
        pub from: String,
        pub endpoint: String,
    }

    impl ResendConfig {
        pub fn new(api_key: impl Into<String>, from: impl Into<String>) -> Self {
            Self {
                api_key: SecretString::new(api_key.into()),
                from: from.into(),
                endpoint: RESEND_ENDPOINT.to_string(),
            }
        }
    }

    pub struct ResendMailer {
        client: reqwest::Client,
        config: ResendConfig,
    }

    impl ResendMailer {
        pub fn new(config: ResendConfig) -> Self {
            Self {
                client: reqwest::Client::new(),
                config,
            }
        }

        pub fn sender(&self) -> &str {
            &self.config.from
        }
    }

    #[async_trait::async_trait]
    impl Mailer for ResendMailer {
        #[instrument(skip(self, message), fields(subject = %message.subject))]
        async fn send(&self, message: &EmailMessage) -> Result<(), MailError> {
            message.validate()?;

            let response = self
                .client
                .post(&self.config.endpoint)
                .bearer_auth(self.config.api_key.expose_secret())
                .json(message)
                .send()
                .await
                .map_err(|e| MailError::Transport {
                    message: e.to_string(),
                })?;

            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                warn!(status = status.as_u16(), "mail provider refused message");
                return Err(MailError::Refused {
                    status: status.as_u16(),
                    message,
                });
            }

            info!("email sent");
            Ok(())
        }
    }
}
