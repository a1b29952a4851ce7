//! Outbound email provider abstraction.
//!
//! The worker only sees [`Mailer`]. Real providers (Gmail, SMTP relays)
//! live outside this crate; [`LogMailer`] is a dry-run implementation that
//! logs instead of sending.

use std::future::Future;
use uuid::Uuid;

/// Provider acknowledgement of an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub provider_message_id: String,
}

/// Provider failure, classified by whether a later attempt could succeed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MailerError {
    /// Rate limits, timeouts, 5xx responses.
    #[error("retryable send failure: {0}")]
    Retryable(String),

    /// Rejected recipient, revoked credentials, malformed message.
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

impl MailerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, MailerError::Retryable(_))
    }
}

/// An email provider bound to the owner's sending accounts.
pub trait Mailer: Send + Sync + 'static {
    /// Send one HTML email from `account_id` to `to`.
    fn send(
        &self,
        account_id: Uuid,
        to: &str,
        subject: &str,
        html: &str,
    ) -> impl Future<Output = Result<SentMessage, MailerError>> + Send;

    /// Check that the account's stored credentials still work.
    fn verify_credentials(
        &self,
        account_id: Uuid,
    ) -> impl Future<Output = Result<(), MailerError>> + Send;
}

/// Logs every message and reports it as sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

impl Mailer for LogMailer {
    async fn send(
        &self,
        account_id: Uuid,
        to: &str,
        subject: &str,
        html: &str,
    ) -> Result<SentMessage, MailerError> {
        let provider_message_id = format!("dry-run-{}", Uuid::new_v4());
        tracing::info!(
            %account_id,
            to,
            subject,
            body_len = html.len(),
            message_id = %provider_message_id,
            "dry-run send"
        );
        Ok(SentMessage {
            provider_message_id,
        })
    }

    async fn verify_credentials(&self, account_id: Uuid) -> Result<(), MailerError> {
        tracing::debug!(%account_id, "dry-run credential check");
        Ok(())
    }
}

/// Substitute `{{first_name}}`, `{{email}}`, and `{{unsubscribe_token}}`.
///
/// A missing first name renders as "there".
pub fn render(template: &str, first_name: Option<&str>, email: &str, token: Uuid) -> String {
    let first_name = first_name
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or("there");
    template
        .replace("{{first_name}}", first_name)
        .replace("{{email}}", email)
        .replace("{{unsubscribe_token}}", &token.to_string())
}
