//! Contacts attached to a campaign and their position in the email sequence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CampaignId, ContactId, OwnerId};
use crate::error::Error;

/// Per-contact status within one campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    /// Attached, not yet launched.
    Pending,
    /// Launched; at least one email is still due.
    InProgress,
    /// Every email in the sequence went out.
    Completed,
    Replied,
    Unsubscribed,
    /// A send failed permanently or exhausted its retries.
    Failed,
    Bounced,
}

impl ContactStatus {
    pub const ALL: [ContactStatus; 7] = [
        ContactStatus::Pending,
        ContactStatus::InProgress,
        ContactStatus::Completed,
        ContactStatus::Replied,
        ContactStatus::Unsubscribed,
        ContactStatus::Failed,
        ContactStatus::Bounced,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ContactStatus::Pending => "pending",
            ContactStatus::InProgress => "in_progress",
            ContactStatus::Completed => "completed",
            ContactStatus::Replied => "replied",
            ContactStatus::Unsubscribed => "unsubscribed",
            ContactStatus::Failed => "failed",
            ContactStatus::Bounced => "bounced",
        }
    }

    /// No further email will be sent to a contact in a terminal status.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ContactStatus::Pending | ContactStatus::InProgress)
    }

    /// Outcomes reported by collaborators outside the send path
    /// (reply detection, unsubscribe links, bounce handling).
    pub fn is_external_outcome(self) -> bool {
        matches!(
            self,
            ContactStatus::Replied | ContactStatus::Unsubscribed | ContactStatus::Bounced
        )
    }
}

impl std::fmt::Display for ContactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContactStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Other(format!("unknown contact status: {s}")))
    }
}

/// An addressable person. Owned by the external contacts layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub owner_id: OwnerId,
    pub email: String,
    pub first_name: Option<String>,
}

/// A contact's membership in a campaign, with sequence progress.
///
/// `current_email_number` is 1-based and runs one past `total_emails` once
/// the last email has been sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignContact {
    pub campaign_id: CampaignId,
    pub contact_id: ContactId,
    pub status: ContactStatus,
    pub current_email_number: u32,
    pub total_emails: u32,
    pub sequence_started_at: Option<DateTime<Utc>>,
    pub next_email_send_at: Option<DateTime<Utc>>,
    pub last_email_sent_at: Option<DateTime<Utc>>,
}

impl CampaignContact {
    /// Has every email in the sequence been sent?
    pub fn is_sequence_done(&self) -> bool {
        self.current_email_number > self.total_emails
    }
}

/// One precomputed email of a contact's sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceEmail {
    pub email_number: u32,
    /// Days after `sequence_started_at` this email becomes due.
    pub day_offset: u32,
    pub subject: String,
    pub body: String,
}

impl SequenceEmail {
    pub fn new(
        email_number: u32,
        day_offset: u32,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            email_number,
            day_offset,
            subject: subject.into(),
            body: body.into(),
        }
    }
}
