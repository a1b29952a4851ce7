//! Sequence progress tracker.
//!
//! Each attached contact carries a cursor (`current_email_number`) into its
//! precomputed sequence. Only the next step is ever queued: when email N is
//! sent the cursor moves to N+1 and the job for N+1 is enqueued, due at
//! `sequence_started_at + day_offset(N+1)`.
//!
//! Bookkeeping for a send runs in one transaction that first locks the
//! campaign row. That orders concurrent workers finishing contacts of the
//! same campaign, so the last one to commit always sees every other contact
//! settled and can complete the campaign.

use chrono::{DateTime, Utc};

use super::events::record_event_on;
use super::jobs::{complete_job, insert_job};
use super::validate::COMPLETE_SEQUENCE_EXISTS;
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::model::campaign::CampaignStatus;
use crate::model::contact::{CampaignContact, ContactStatus};
use crate::model::job::{JobPayload, NewJob, SendEmail, sequence_step_key};
use crate::model::{CampaignId, ContactId, JobId, OwnerId};
use sqlx::PgConnection;
use uuid::Uuid;

const CAMPAIGN_CONTACT_COLUMNS: &str = "campaign_id, contact_id, status, current_email_number, total_emails, sequence_started_at, next_email_send_at, last_email_sent_at";

/// A contact whose sequence was started at launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartedContact {
    pub contact_id: ContactId,
    /// Length of the saved sequence, or `None` for the uniform template.
    pub sequence_len: Option<u32>,
}

/// What recording a send did to the contact's progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Cursor moved; the next step is queued.
    Next {
        email_number: u32,
        run_at: DateTime<Utc>,
        /// `None` if a job with the step's idempotency key already existed.
        job_id: Option<JobId>,
    },
    /// That was the last email. The contact is `completed`.
    Finished {
        total_emails: u32,
        campaign_completed: bool,
    },
    /// The cursor was not at this email (already advanced by an earlier run
    /// of the same job, or the contact left the sequence). Nothing changed.
    Stale,
}

/// What the worker hands over after a successful send.
#[derive(Debug, Clone)]
pub struct SentEmail {
    pub job_id: JobId,
    pub campaign_id: CampaignId,
    pub contact_id: ContactId,
    pub email_number: u32,
    pub provider_message_id: String,
    pub subject: String,
}

/// Lock the campaign row for the rest of the transaction.
pub(crate) async fn lock_campaign_on(
    conn: &mut PgConnection,
    campaign_id: CampaignId,
) -> Result<CampaignStatus> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT status FROM campaigns WHERE id = $1 FOR UPDATE")
            .bind(campaign_id.0)
            .fetch_optional(&mut *conn)
            .await?;

    row.ok_or_else(|| Error::NotFound(format!("campaign {campaign_id}")))?
        .0
        .parse()
}

/// Initialize progress for every `pending` contact and mark it `in_progress`.
///
/// Contacts with a complete saved sequence get `total_emails = N`; the rest
/// go out on the uniform template as a single email.
pub(crate) async fn start_sequences_on(
    conn: &mut PgConnection,
    campaign_id: CampaignId,
    now: DateTime<Utc>,
) -> Result<Vec<StartedContact>> {
    let rows: Vec<(Uuid, i32)> = sqlx::query_as(&format!(
        "UPDATE campaign_contacts target SET
            status = 'in_progress',
            total_emails = GREATEST(s.sequence_len, 1),
            current_email_number = 1,
            sequence_started_at = $2,
            next_email_send_at = $2,
            updated_at = now()
         FROM (
            SELECT cc.contact_id,
                   (CASE WHEN {COMPLETE_SEQUENCE_EXISTS}
                         THEN (SELECT count(*) FROM sequence_emails se
                               WHERE se.campaign_id = cc.campaign_id AND se.contact_id = cc.contact_id)
                         ELSE 0 END)::int AS sequence_len
            FROM campaign_contacts cc
            WHERE cc.campaign_id = $1 AND cc.status = 'pending'
         ) s
         WHERE target.campaign_id = $1 AND target.contact_id = s.contact_id
         RETURNING target.contact_id, s.sequence_len"
    ))
    .bind(campaign_id.0)
    .bind(now)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(contact_id, len)| StartedContact {
            contact_id: ContactId(contact_id),
            sequence_len: (len > 0).then_some(len as u32),
        })
        .collect())
}

/// Move the cursor past `sent_number` and queue the following step.
///
/// Only advances when the cursor is exactly at `sent_number`, which makes a
/// repeated run of the same job a no-op.
pub(crate) async fn advance_on(
    conn: &mut PgConnection,
    campaign_id: CampaignId,
    contact_id: ContactId,
    sent_number: u32,
    now: DateTime<Utc>,
    max_attempts: u32,
) -> Result<Advance> {
    let row: Option<(String, i32, Option<DateTime<Utc>>)> = sqlx::query_as(
        "UPDATE campaign_contacts SET
            current_email_number = current_email_number + 1,
            last_email_sent_at = $4,
            status = CASE WHEN current_email_number + 1 > total_emails THEN 'completed' ELSE status END,
            next_email_send_at = CASE WHEN current_email_number + 1 > total_emails THEN NULL ELSE next_email_send_at END,
            updated_at = now()
         WHERE campaign_id = $1 AND contact_id = $2
           AND current_email_number = $3 AND status = 'in_progress'
         RETURNING status, total_emails, sequence_started_at",
    )
    .bind(campaign_id.0)
    .bind(contact_id.0)
    .bind(sent_number as i32)
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((status, total_emails, started_at)) = row else {
        return Ok(Advance::Stale);
    };
    let total_emails = total_emails as u32;

    if status.parse::<ContactStatus>()? == ContactStatus::Completed {
        record_event_on(
            conn,
            campaign_id,
            Some(contact_id),
            &EventKind::SequenceCompleted { total_emails },
        )
        .await?;
        let campaign_completed = complete_if_finished_on(conn, campaign_id).await?;
        return Ok(Advance::Finished {
            total_emails,
            campaign_completed,
        });
    }

    let next = sent_number + 1;
    let day_offset: Option<(i32,)> = sqlx::query_as(
        "SELECT day_offset FROM sequence_emails
         WHERE campaign_id = $1 AND contact_id = $2 AND email_number = $3",
    )
    .bind(campaign_id.0)
    .bind(contact_id.0)
    .bind(next as i32)
    .fetch_optional(&mut *conn)
    .await?;
    let day_offset =
        day_offset.ok_or_else(|| Error::NotFound(format!("sequence email {next} for contact {contact_id}")))?.0;

    let run_at = next_run_at(started_at.unwrap_or(now), day_offset as u32);

    sqlx::query(
        "UPDATE campaign_contacts SET next_email_send_at = $3
         WHERE campaign_id = $1 AND contact_id = $2",
    )
    .bind(campaign_id.0)
    .bind(contact_id.0)
    .bind(run_at)
    .execute(&mut *conn)
    .await?;

    let payload = JobPayload::SendEmail(SendEmail {
        campaign_id,
        contact_id,
        email_number: Some(next),
    });
    let job = insert_job(
        conn,
        &NewJob::for_payload(&payload)
            .run_at(run_at)
            .idempotency_key(sequence_step_key(campaign_id, contact_id, next))
            .max_attempts(max_attempts),
    )
    .await?;

    Ok(Advance::Next {
        email_number: next,
        run_at,
        job_id: job.map(|j| j.id),
    })
}

/// When step N+1 of a sequence is due.
pub fn next_run_at(sequence_started_at: DateTime<Utc>, day_offset: u32) -> DateTime<Utc> {
    sequence_started_at + chrono::Duration::days(i64::from(day_offset))
}

/// Move a contact into a terminal status, unless it already is in one.
pub(crate) async fn settle_contact_on(
    conn: &mut PgConnection,
    campaign_id: CampaignId,
    contact_id: ContactId,
    status: ContactStatus,
) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE campaign_contacts SET status = $3, next_email_send_at = NULL, updated_at = now()
         WHERE campaign_id = $1 AND contact_id = $2 AND status IN ('pending', 'in_progress')",
    )
    .bind(campaign_id.0)
    .bind(contact_id.0)
    .bind(status.as_str())
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// Move a running campaign to `completed` once no contact has mail left.
///
/// Callers hold the campaign row lock (see [`lock_campaign_on`]).
pub(crate) async fn complete_if_finished_on(
    conn: &mut PgConnection,
    campaign_id: CampaignId,
) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE campaigns SET status = 'completed', updated_at = now()
         WHERE id = $1 AND status = 'running'
           AND NOT EXISTS (
               SELECT 1 FROM campaign_contacts
               WHERE campaign_id = $1 AND status IN ('pending', 'in_progress')
           )",
    )
    .bind(campaign_id.0)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if rows == 1 {
        record_event_on(conn, campaign_id, None, &EventKind::AutoCompleted).await?;
        tracing::info!(campaign_id = %campaign_id, "campaign completed: no contact has mail left");
    }
    Ok(rows == 1)
}

/// The send behind a job failed for good: mark its contact `failed` and
/// complete the campaign if that contact was the last with mail left.
///
/// Callers hold the campaign row lock and retire the job in the same
/// transaction. Returns whether the contact changed.
pub(crate) async fn fail_contact_on(
    conn: &mut PgConnection,
    send: &SendEmail,
    attempt: u32,
    error: &str,
) -> Result<bool> {
    let changed =
        settle_contact_on(conn, send.campaign_id, send.contact_id, ContactStatus::Failed).await?;
    if !changed {
        return Ok(false);
    }

    record_event_on(
        conn,
        send.campaign_id,
        Some(send.contact_id),
        &EventKind::EmailFailed {
            email_number: send.email_number.unwrap_or(1),
            error: error.to_string(),
            attempt,
            retryable: false,
        },
    )
    .await?;
    complete_if_finished_on(conn, send.campaign_id).await?;
    Ok(true)
}

impl super::Db {
    /// Record a successful send: store the message, advance the contact's
    /// cursor, queue the next step, and complete the job, all in one
    /// transaction.
    ///
    /// A send whose cursor already moved on (a re-run of the same job) only
    /// completes the job and returns [`Advance::Stale`].
    pub async fn record_send(&self, sent: &SentEmail) -> Result<Advance> {
        let mut tx = self.begin().await?;
        lock_campaign_on(&mut tx, sent.campaign_id).await?;

        // Cursor moves only under the campaign lock, so this holds until commit.
        let at_cursor: Option<(i32,)> = sqlx::query_as(
            "SELECT current_email_number FROM campaign_contacts
             WHERE campaign_id = $1 AND contact_id = $2
               AND current_email_number = $3 AND status = 'in_progress'",
        )
        .bind(sent.campaign_id.0)
        .bind(sent.contact_id.0)
        .bind(sent.email_number as i32)
        .fetch_optional(&mut *tx)
        .await?;
        if at_cursor.is_none() {
            complete_job(&mut tx, sent.job_id).await?;
            tx.commit().await?;
            return Ok(Advance::Stale);
        }

        sqlx::query(
            "INSERT INTO campaign_messages (id, campaign_id, contact_id, email_number, provider_message_id, subject, sent_at)
             VALUES ($1, $2, $3, $4, $5, $6, now())",
        )
        .bind(Uuid::new_v4())
        .bind(sent.campaign_id.0)
        .bind(sent.contact_id.0)
        .bind(sent.email_number as i32)
        .bind(&sent.provider_message_id)
        .bind(&sent.subject)
        .execute(&mut *tx)
        .await?;

        record_event_on(
            &mut tx,
            sent.campaign_id,
            Some(sent.contact_id),
            &EventKind::EmailSent {
                email_number: sent.email_number,
                provider_message_id: sent.provider_message_id.clone(),
            },
        )
        .await?;

        let advance = advance_on(
            &mut tx,
            sent.campaign_id,
            sent.contact_id,
            sent.email_number,
            Utc::now(),
            self.job_max_attempts,
        )
        .await?;

        complete_job(&mut tx, sent.job_id).await?;
        tx.commit().await?;
        Ok(advance)
    }

    /// Report an outcome detected outside the send path: a reply, an
    /// unsubscribe, or a bounce. The contact receives no further email.
    /// Returns `false` if the contact had already settled.
    pub async fn record_contact_outcome(
        &self,
        owner: OwnerId,
        campaign_id: CampaignId,
        contact_id: ContactId,
        status: ContactStatus,
    ) -> Result<bool> {
        if !status.is_external_outcome() {
            return Err(Error::InvalidInput(format!(
                "{status} is not an external contact outcome"
            )));
        }

        let mut tx = self.begin().await?;

        let owned: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM campaigns WHERE id = $1 AND owner_id = $2")
                .bind(campaign_id.0)
                .bind(owner.0)
                .fetch_optional(&mut *tx)
                .await?;
        if owned.is_none() {
            return Err(Error::NotFound(format!("campaign {campaign_id}")));
        }
        lock_campaign_on(&mut tx, campaign_id).await?;

        let changed = settle_contact_on(&mut tx, campaign_id, contact_id, status).await?;
        if changed {
            record_event_on(
                &mut tx,
                campaign_id,
                Some(contact_id),
                &EventKind::ContactOutcome { status },
            )
            .await?;
            complete_if_finished_on(&mut tx, campaign_id).await?;
        }

        tx.commit().await?;
        Ok(changed)
    }

    /// Progress of one contact in one campaign.
    pub async fn get_campaign_contact(
        &self,
        campaign_id: CampaignId,
        contact_id: ContactId,
    ) -> Result<CampaignContact> {
        let row: Option<CampaignContactRow> = sqlx::query_as(&format!(
            "SELECT {CAMPAIGN_CONTACT_COLUMNS} FROM campaign_contacts
             WHERE campaign_id = $1 AND contact_id = $2"
        ))
        .bind(campaign_id.0)
        .bind(contact_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("contact {contact_id} in campaign {campaign_id}")))?
            .try_into_campaign_contact()
    }

    /// Progress of every contact in a campaign.
    pub async fn list_campaign_contacts(
        &self,
        campaign_id: CampaignId,
    ) -> Result<Vec<CampaignContact>> {
        let rows: Vec<CampaignContactRow> = sqlx::query_as(&format!(
            "SELECT {CAMPAIGN_CONTACT_COLUMNS} FROM campaign_contacts
             WHERE campaign_id = $1
             ORDER BY created_at ASC"
        ))
        .bind(campaign_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(CampaignContactRow::try_into_campaign_contact)
            .collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct CampaignContactRow {
    campaign_id: Uuid,
    contact_id: Uuid,
    status: String,
    current_email_number: i32,
    total_emails: i32,
    sequence_started_at: Option<DateTime<Utc>>,
    next_email_send_at: Option<DateTime<Utc>>,
    last_email_sent_at: Option<DateTime<Utc>>,
}

impl CampaignContactRow {
    fn try_into_campaign_contact(self) -> Result<CampaignContact> {
        Ok(CampaignContact {
            campaign_id: CampaignId(self.campaign_id),
            contact_id: ContactId(self.contact_id),
            status: self.status.parse()?,
            current_email_number: self.current_email_number as u32,
            total_emails: self.total_emails as u32,
            sequence_started_at: self.sequence_started_at,
            next_email_send_at: self.next_email_send_at,
            last_email_sent_at: self.last_email_sent_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn next_step_is_offset_from_sequence_start_not_last_send() {
        let started = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        assert_eq!(next_run_at(started, 0), started);
        assert_eq!(
            next_run_at(started, 3),
            Utc.with_ymd_and_hms(2026, 3, 5, 9, 0, 0).unwrap()
        );
    }
}
