use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument};
use url::Url;

use crate::capabilities::{EmailMessage, MailError, Mailer};

pub const DEFAULT_APP_URL: &str = "http://localhost:5173";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InviteError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid app url: {0}")]
    InvalidAppUrl(String),

    #[error("account lookup failed: {0}")]
    Directory(String),

    #[error(transparent)]
    Mail(#[from] MailError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InviteConfig {
    pub app_url: String,
    pub from: String,
}

impl Default for InviteConfig {
    fn default() -> Self {
        Self {
            app_url: DEFAULT_APP_URL.to_string(),
            from: "GrocLi <info@localhost>".to_string(),
        }
    }
}

/// Body of an invite request as sent by the client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InviteRequest {
    pub email: String,
    pub list_name: String,
    pub invite_id: String,
    pub list_id: String,
    pub inviter_email: String,
}

impl InviteRequest {
    pub fn validate(&self) -> Result<(), InviteError> {
        for (field, value) in [
            ("email", &self.email),
            ("listName", &self.list_name),
            ("inviteId", &self.invite_id),
            ("listId", &self.list_id),
            ("inviterEmail", &self.inviter_email),
        ] {
            if value.trim().is_empty() {
                return Err(InviteError::MissingField(field));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InviteOutcome {
    /// The address already has an account and was told about the list.
    Existing,
    /// The address received a sign-up link.
    New,
}

#[async_trait::async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Case-insensitive lookup by email address.
    async fn account_exists(&self, email: &str) -> Result<bool, InviteError>;
}

#[derive(Debug, Default)]
pub struct MemoryDirectory {
    emails: HashSet<String>,
}

impl MemoryDirectory {
    pub fn new<I, T>(emails: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        Self {
            emails: emails.into_iter().map(|e| e.as_ref().to_lowercase()).collect(),
        }
    }
}

#[async_trait::async_trait]
impl AccountDirectory for MemoryDirectory {
    async fn account_exists(&self, email: &str) -> Result<bool, InviteError> {
        Ok(self.emails.contains(&email.to_lowercase()))
    }
}

/// Sends the single notification email for an invite. Failures are returned
/// to the caller; nothing is retried here.
pub struct InviteService {
    directory: Arc<dyn AccountDirectory>,
    mailer: Arc<dyn Mailer>,
    config: InviteConfig,
}

impl InviteService {
    pub fn new(
        directory: Arc<dyn AccountDirectory>,
        mailer: Arc<dyn Mailer>,
        config: InviteConfig,
    ) -> Self {
        Self {
            directory,
            mailer,
            config,
        }
    }

    #[instrument(skip(self, request), fields(list_id = %request.list_id, invite_id = %request.invite_id))]
    pub async fn send(&self, request: &InviteRequest) -> Result<InviteOutcome, InviteError> {
        request.validate()?;

        let existing = self.directory.account_exists(&request.email).await?;
        let (outcome, message) = if existing {
            (InviteOutcome::Existing, self.added_message(request))
        } else {
            (InviteOutcome::New, self.invite_message(request)?)
        };

        if let Err(e) = self.mailer.send(&message).await {
            error!(error = %e, "invite email failed");
            return Err(e.into());
        }
        info!(?outcome, "invite email sent");
        Ok(outcome)
    }

    /// `<app_url>/login?invite=<id>&email=<address>`
    pub fn invite_link(&self, request: &InviteRequest) -> Result<Url, InviteError> {
        let mut url = Url::parse(&self.config.app_url)
            .map_err(|e| InviteError::InvalidAppUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| InviteError::InvalidAppUrl(self.config.app_url.clone()))?
            .pop_if_empty()
            .push("login");
        url.query_pairs_mut()
            .append_pair("invite", &request.invite_id)
            .append_pair("email", &request.email);
        Ok(url)
    }

    fn added_message(&self, request: &InviteRequest) -> EmailMessage {
        EmailMessage {
            from: self.config.from.clone(),
            to: request.email.clone(),
            subject: format!("You've been added to {}", request.list_name),
            html: format!(
                "<p>{} has added you to <strong>{}</strong>.</p>",
                escape_html(&request.inviter_email),
                escape_html(&request.list_name)
            ),
        }
    }

    fn invite_message(&self, request: &InviteRequest) -> Result<EmailMessage, InviteError> {
        let link = self.invite_link(request)?;
        Ok(EmailMessage {
            from: self.config.from.clone(),
            to: request.email.clone(),
            subject: format!("You're invited to join {}", request.list_name),
            html: format!(
                "<h2>You've been invited to join <strong>{}</strong></h2>\
                 <p>Invited by: {}</p>\
                 <p><a href=\"{}\">Join the list</a></p>",
                escape_html(&request.list_name),
                escape_html(&request.inviter_email),
                escape_html(link.as_str())
            ),
        })
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
