//! Campaign lifecycle types and the legal transition table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CampaignId, OwnerId};
use crate::error::Error;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    /// Being assembled. Contacts and content can still change.
    Draft,
    /// Validated and waiting for launch (possibly scheduled).
    Ready,
    /// Sending. The worker acts on this campaign's jobs.
    Running,
    /// Sends are held. Jobs that fire while paused are deferred.
    Paused,
    /// Every contact reached a terminal status. Terminal.
    Completed,
    /// Stopped by the owner. Terminal.
    Cancelled,
}

impl CampaignStatus {
    pub const ALL: [CampaignStatus; 6] = [
        CampaignStatus::Draft,
        CampaignStatus::Ready,
        CampaignStatus::Running,
        CampaignStatus::Paused,
        CampaignStatus::Completed,
        CampaignStatus::Cancelled,
    ];

    /// Statuses from which a campaign row may be deleted.
    pub const DELETABLE: [CampaignStatus; 3] = [
        CampaignStatus::Draft,
        CampaignStatus::Paused,
        CampaignStatus::Completed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Ready => "ready",
            CampaignStatus::Running => "running",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_deletable(self) -> bool {
        Self::DELETABLE.contains(&self)
    }

    /// Can contacts still be attached or detached?
    pub fn is_editable(self) -> bool {
        matches!(self, CampaignStatus::Draft | CampaignStatus::Ready)
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Cancelled)
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Other(format!("unknown campaign status: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// A lifecycle operation. Each one is a single conditional update from a set
/// of source states to one target state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignOp {
    MarkReady,
    Launch,
    Pause,
    Resume,
    Cancel,
    Complete,
}

impl CampaignOp {
    /// States this operation may start from.
    pub fn from_states(self) -> &'static [CampaignStatus] {
        use CampaignStatus::*;
        match self {
            CampaignOp::MarkReady => &[Draft],
            CampaignOp::Launch => &[Draft, Ready],
            CampaignOp::Pause => &[Running],
            CampaignOp::Resume => &[Paused],
            CampaignOp::Cancel => &[Draft, Ready, Running, Paused],
            CampaignOp::Complete => &[Running],
        }
    }

    /// State the campaign lands in.
    pub fn target(self) -> CampaignStatus {
        match self {
            CampaignOp::MarkReady => CampaignStatus::Ready,
            CampaignOp::Launch | CampaignOp::Resume => CampaignStatus::Running,
            CampaignOp::Pause => CampaignStatus::Paused,
            CampaignOp::Cancel => CampaignStatus::Cancelled,
            CampaignOp::Complete => CampaignStatus::Completed,
        }
    }

    pub fn is_allowed_from(self, status: CampaignStatus) -> bool {
        self.from_states().contains(&status)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CampaignOp::MarkReady => "mark_ready",
            CampaignOp::Launch => "launch",
            CampaignOp::Pause => "pause",
            CampaignOp::Resume => "resume",
            CampaignOp::Cancel => "cancel",
            CampaignOp::Complete => "complete",
        }
    }
}

impl std::fmt::Display for CampaignOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Campaign
// ---------------------------------------------------------------------------

/// A named outreach effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub owner_id: OwnerId,
    pub name: String,
    pub status: CampaignStatus,
    /// Uniform template, used for contacts without a saved sequence.
    pub template: Option<Template>,
    /// Sending email account. Resolved by the mailer.
    pub from_account_id: Option<uuid::Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Uniform subject + body shared by every contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub subject: String,
    pub body: String,
}

/// What lifecycle operations return: the campaign and where it landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignSummary {
    pub id: CampaignId,
    pub status: CampaignStatus,
}

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

/// Why a campaign cannot launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationReason {
    NotFound,
    NoContacts,
    NoFromAccount,
    MissingEmailContent,
}

impl ValidationReason {
    pub fn code(self) -> &'static str {
        match self {
            ValidationReason::NotFound => "NOT_FOUND",
            ValidationReason::NoContacts => "NO_CONTACTS",
            ValidationReason::NoFromAccount => "NO_FROM_ACCOUNT",
            ValidationReason::MissingEmailContent => "MISSING_EMAIL_CONTENT",
        }
    }
}

/// Result of a readiness check. Carries every failing reason, not just the first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Readiness {
    pub valid: bool,
    pub reasons: Vec<ValidationReason>,
}

impl Readiness {
    pub fn from_reasons(reasons: Vec<ValidationReason>) -> Self {
        Self {
            valid: reasons.is_empty(),
            reasons,
        }
    }

    pub fn has(&self, reason: ValidationReason) -> bool {
        self.reasons.contains(&reason)
    }
}
