//! Durable jobs and the typed payloads they carry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CampaignId, ContactId, JobId, OwnerId};
use crate::error::{Error, Result};

/// Queue that delivers one email to one contact.
pub const SEND_EMAIL_QUEUE: &str = "send-email";
/// Queue that launches a campaign at a scheduled time.
pub const SCHEDULE_CAMPAIGN_QUEUE: &str = "schedule-campaign";

/// Attempts allowed when the caller doesn't say otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A durable unit of deferred work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    /// Opaque to the queue. Decoded by the worker via [`JobPayload::decode`].
    pub payload: serde_json::Value,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    pub idempotency_key: Option<String>,
    pub last_error: Option<String>,
    /// When the current claim was taken. Set only while `running`.
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    /// Retries exhausted or failed permanently. Terminal.
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::Other(format!("unknown job status: {other}"))),
        }
    }
}

/// What happened when a job attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to `pending`, claimable again at `run_at`.
    Retrying { attempts: u32, run_at: DateTime<Utc> },
    /// Attempts exhausted (or the failure was not retryable). Terminal.
    PermanentlyFailed { attempts: u32 },
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for enqueueing a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) queue: String,
    pub(crate) payload: serde_json::Value,
    pub(crate) run_at: Option<DateTime<Utc>>,
    pub(crate) idempotency_key: Option<String>,
    pub(crate) max_attempts: u32,
}

impl NewJob {
    pub fn new(queue: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            queue: queue.into(),
            payload,
            run_at: None,
            idempotency_key: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// A job for a typed payload, routed to the payload's queue.
    pub fn for_payload(payload: &JobPayload) -> Self {
        Self::new(payload.queue(), payload.to_value())
    }

    /// Earliest eligible execution time. Defaults to now.
    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Send one email of a contact's sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEmail {
    pub campaign_id: CampaignId,
    pub contact_id: ContactId,
    /// Position in a saved sequence. `None` means the uniform template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_number: Option<u32>,
}

/// Launch a campaign once its scheduled time arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleCampaign {
    pub campaign_id: CampaignId,
    pub owner_id: OwnerId,
}

/// Typed job payload. The queue name is the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPayload {
    SendEmail(SendEmail),
    ScheduleCampaign(ScheduleCampaign),
}

impl JobPayload {
    pub fn queue(&self) -> &'static str {
        match self {
            JobPayload::SendEmail(_) => SEND_EMAIL_QUEUE,
            JobPayload::ScheduleCampaign(_) => SCHEDULE_CAMPAIGN_QUEUE,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        // Both payloads are plain structs of ids and integers.
        let value = match self {
            JobPayload::SendEmail(p) => serde_json::to_value(p),
            JobPayload::ScheduleCampaign(p) => serde_json::to_value(p),
        };
        value.unwrap_or(serde_json::Value::Null)
    }

    /// Decode a payload read from `queue`. Unknown queues and malformed
    /// payloads are errors for the caller to park, not panics.
    pub fn decode(queue: &str, payload: &serde_json::Value) -> Result<Self> {
        let bad = |e: serde_json::Error| Error::Payload(format!("{queue}: {e}"));
        match queue {
            SEND_EMAIL_QUEUE => Ok(JobPayload::SendEmail(
                SendEmail::deserialize(payload).map_err(bad)?,
            )),
            SCHEDULE_CAMPAIGN_QUEUE => Ok(JobPayload::ScheduleCampaign(
                ScheduleCampaign::deserialize(payload).map_err(bad)?,
            )),
            other => Err(Error::Payload(format!("no payload type for queue {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Idempotency keys
// ---------------------------------------------------------------------------

/// Key for email `n` of a saved sequence: `<campaign>:<contact>:<n>`.
pub fn sequence_step_key(campaign_id: CampaignId, contact_id: ContactId, n: u32) -> String {
    format!("{campaign_id}:{contact_id}:{n}")
}

/// Key for the single uniform-template email: `<campaign>:<contact>`.
pub fn template_send_key(campaign_id: CampaignId, contact_id: ContactId) -> String {
    format!("{campaign_id}:{contact_id}")
}

/// Key for a scheduled launch: `<campaign>:launch`.
pub fn scheduled_launch_key(campaign_id: CampaignId) -> String {
    format!("{campaign_id}:launch")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn send_email_payload_uses_camel_case_ids() {
        let campaign_id = CampaignId::new();
        let contact_id = ContactId::new();
        let payload = JobPayload::SendEmail(SendEmail {
            campaign_id,
            contact_id,
            email_number: Some(2),
        });

        assert_eq!(payload.queue(), SEND_EMAIL_QUEUE);
        assert_eq!(
            payload.to_value(),
            json!({
                "campaignId": campaign_id.0,
                "contactId": contact_id.0,
                "emailNumber": 2,
            })
        );
    }

    #[test]
    fn decode_is_keyed_by_queue() {
        let campaign_id = CampaignId::new();
        let contact_id = ContactId::new();
        let value = json!({"campaignId": campaign_id.0, "contactId": contact_id.0});

        let decoded = JobPayload::decode(SEND_EMAIL_QUEUE, &value).unwrap();
        assert_eq!(
            decoded,
            JobPayload::SendEmail(SendEmail {
                campaign_id,
                contact_id,
                email_number: None,
            })
        );

        // Same JSON on the wrong queue lacks ownerId.
        assert!(matches!(
            JobPayload::decode(SCHEDULE_CAMPAIGN_QUEUE, &value),
            Err(Error::Payload(_))
        ));
        assert!(matches!(
            JobPayload::decode("reports", &value),
            Err(Error::Payload(_))
        ));
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = JobPayload::decode(SEND_EMAIL_QUEUE, &json!("not an object")).unwrap_err();
        assert_eq!(err.code(), "BAD_PAYLOAD");
    }

    #[test]
    fn idempotency_keys_match_documented_shapes() {
        let campaign_id = CampaignId::new();
        let contact_id = ContactId::new();
        assert_eq!(
            sequence_step_key(campaign_id, contact_id, 3),
            format!("{}:{}:3", campaign_id.0, contact_id.0)
        );
        assert_eq!(
            template_send_key(campaign_id, contact_id),
            format!("{}:{}", campaign_id.0, contact_id.0)
        );
        assert!(scheduled_launch_key(campaign_id).ends_with(":launch"));
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        let job = NewJob::new(SEND_EMAIL_QUEUE, json!({})).max_attempts(0);
        assert_eq!(job.max_attempts, 1);
    }
}
