//! Structured campaign events.
//!
//! Every status change, send, and per-contact outcome is appended to
//! `campaign_events`. Consumers read them to build activity feeds and
//! audit logs. Deleting a campaign deletes its events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ContactId;
use crate::model::campaign::{CampaignOp, CampaignStatus};
use crate::model::contact::ContactStatus;

/// A stored campaign event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: i64,
    pub contact_id: Option<ContactId>,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    StatusChanged {
        op: CampaignOp,
        to: CampaignStatus,
    },
    EmailSent {
        email_number: u32,
        provider_message_id: String,
    },
    EmailFailed {
        email_number: u32,
        error: String,
        attempt: u32,
        retryable: bool,
    },
    SequenceCompleted {
        total_emails: u32,
    },
    ContactOutcome {
        status: ContactStatus,
    },
    /// Campaign moved running → completed because no contact had mail left.
    AutoCompleted,
}

impl EventKind {
    /// Short name, used as a log field.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::StatusChanged { .. } => "status_changed",
            EventKind::EmailSent { .. } => "email_sent",
            EventKind::EmailFailed { .. } => "email_failed",
            EventKind::SequenceCompleted { .. } => "sequence_completed",
            EventKind::ContactOutcome { .. } => "contact_outcome",
            EventKind::AutoCompleted => "auto_completed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_with_type_tag() {
        let kind = EventKind::StatusChanged {
            op: CampaignOp::Pause,
            to: CampaignStatus::Paused,
        };
        let value = serde_json::to_value(&kind).unwrap();
        assert_eq!(value["type"], "status_changed");
        assert_eq!(value["op"], "pause");
        assert_eq!(value["to"], "paused");

        let back: EventKind = serde_json::from_value(value).unwrap();
        assert_eq!(back, kind);
    }
}
