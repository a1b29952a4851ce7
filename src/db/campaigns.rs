//! Campaign state machine.
//!
//! Every lifecycle operation is one conditional update:
//!
//! ```sql
//! UPDATE campaigns SET status = <to>
//! WHERE id = <id> AND owner_id = <owner> AND status = ANY(<from-set>)
//! ```
//!
//! and succeeds only if exactly one row changed. Two callers racing on the
//! same campaign serialize on the row; the loser's predicate no longer
//! matches and it gets `ILLEGAL_TRANSITION`.

use chrono::{DateTime, Utc};

use super::events::record_event_on;
use super::jobs::insert_job;
use super::progress::{complete_if_finished_on, lock_campaign_on, start_sequences_on};
use super::validate::validate_on;
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::model::campaign::*;
use crate::model::job::{
    JobPayload, NewJob, ScheduleCampaign, SendEmail, scheduled_launch_key, sequence_step_key,
    template_send_key,
};
use crate::model::{CampaignId, OwnerId};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use sqlx::PgConnection;
use tracing::info;
use uuid::Uuid;

/// What a launch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchReport {
    pub campaign: CampaignSummary,
    /// Contacts started on a saved per-contact sequence.
    pub sequence_contacts: u32,
    /// Contacts sent the uniform template.
    pub template_contacts: u32,
    /// Jobs actually inserted (one per started contact unless a key collided).
    pub jobs_enqueued: u32,
}

fn record_op(op: CampaignOp, result: &'static str) {
    metrics::campaign_transitions().add(
        1,
        &[
            KeyValue::new("op", op.as_str()),
            KeyValue::new("result", result),
        ],
    );
}

/// Apply `op` with a single conditional update on an existing connection or
/// transaction.
pub(crate) async fn transition_on(
    conn: &mut PgConnection,
    owner: OwnerId,
    id: CampaignId,
    op: CampaignOp,
) -> Result<CampaignSummary> {
    let from: Vec<&str> = op.from_states().iter().map(|s| s.as_str()).collect();
    let to = op.target();

    let updated: Option<(Uuid,)> = sqlx::query_as(
        "UPDATE campaigns SET status = $1, updated_at = now()
         WHERE id = $2 AND owner_id = $3 AND status = ANY($4)
         RETURNING id",
    )
    .bind(to.as_str())
    .bind(id.0)
    .bind(owner.0)
    .bind(from)
    .fetch_optional(&mut *conn)
    .await?;

    if updated.is_none() {
        // Zero rows: either the campaign isn't ours or its status didn't match.
        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM campaigns WHERE id = $1 AND owner_id = $2")
                .bind(id.0)
                .bind(owner.0)
                .fetch_optional(&mut *conn)
                .await?;
        return match current {
            None => {
                record_op(op, "not_found");
                Err(Error::NotFound(format!("campaign {id}")))
            }
            Some((status,)) => {
                record_op(op, "illegal");
                Err(Error::IllegalTransition {
                    op,
                    from: status.parse()?,
                })
            }
        };
    }

    record_event_on(conn, id, None, &EventKind::StatusChanged { op, to }).await?;
    record_op(op, "ok");
    info!(campaign_id = %id, op = op.as_str(), to = to.as_str(), "campaign transition");

    Ok(CampaignSummary { id, status: to })
}

/// Lock the owned campaign row, then fail with `NOT_FOUND` or
/// `VALIDATION_FAILED` unless it is ready.
///
/// Content edits take the same row lock, so nothing can change what was
/// validated before the caller commits.
async fn require_ready_on(
    conn: &mut PgConnection,
    owner: OwnerId,
    id: CampaignId,
    op: CampaignOp,
) -> Result<()> {
    let locked: Option<(String,)> = sqlx::query_as(
        "SELECT status FROM campaigns WHERE id = $1 AND owner_id = $2 FOR UPDATE",
    )
    .bind(id.0)
    .bind(owner.0)
    .fetch_optional(&mut *conn)
    .await?;
    if locked.is_none() {
        record_op(op, "not_found");
        return Err(Error::NotFound(format!("campaign {id}")));
    }

    let readiness = validate_on(conn, owner, id).await?;
    if readiness.has(ValidationReason::NotFound) {
        record_op(op, "not_found");
        return Err(Error::NotFound(format!("campaign {id}")));
    }
    if !readiness.valid {
        record_op(op, "invalid");
        return Err(Error::ValidationFailed(readiness.reasons));
    }
    Ok(())
}

impl super::Db {
    /// Get a campaign owned by `owner`.
    pub async fn get_campaign(&self, owner: OwnerId, id: CampaignId) -> Result<Campaign> {
        let row: Option<CampaignRow> = sqlx::query_as(
            "SELECT id, owner_id, name, status, subject, body, from_account_id, created_at, updated_at
             FROM campaigns WHERE id = $1 AND owner_id = $2",
        )
        .bind(id.0)
        .bind(owner.0)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| Error::NotFound(format!("campaign {id}")))?
            .try_into_campaign()
    }

    /// Current status of a campaign regardless of owner. For the worker,
    /// which acts on jobs rather than on behalf of a user.
    pub async fn campaign_status(&self, id: CampaignId) -> Result<Option<CampaignStatus>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM campaigns WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(s,)| s.parse()).transpose()
    }

    /// Apply a plain lifecycle operation. No side effects beyond the status
    /// change and its event.
    async fn transition(
        &self,
        owner: OwnerId,
        id: CampaignId,
        op: CampaignOp,
    ) -> Result<CampaignSummary> {
        let mut tx = self.begin().await?;
        let summary = transition_on(&mut tx, owner, id, op).await?;
        tx.commit().await?;
        Ok(summary)
    }

    /// draft → ready, gated on the readiness check.
    pub async fn mark_ready(&self, owner: OwnerId, id: CampaignId) -> Result<CampaignSummary> {
        let mut tx = self.begin().await?;
        require_ready_on(&mut tx, owner, id, CampaignOp::MarkReady).await?;
        let summary = transition_on(&mut tx, owner, id, CampaignOp::MarkReady).await?;
        tx.commit().await?;
        Ok(summary)
    }

    /// Mark the campaign ready and queue its launch for `at`.
    pub async fn schedule(
        &self,
        owner: OwnerId,
        id: CampaignId,
        at: DateTime<Utc>,
    ) -> Result<CampaignSummary> {
        let mut tx = self.begin().await?;
        require_ready_on(&mut tx, owner, id, CampaignOp::MarkReady).await?;
        let summary = transition_on(&mut tx, owner, id, CampaignOp::MarkReady).await?;

        let payload = JobPayload::ScheduleCampaign(ScheduleCampaign {
            campaign_id: id,
            owner_id: owner,
        });
        insert_job(
            &mut tx,
            &NewJob::for_payload(&payload)
                .run_at(at)
                .idempotency_key(scheduled_launch_key(id))
                .max_attempts(self.job_max_attempts),
        )
        .await?;

        tx.commit().await?;
        info!(campaign_id = %id, at = %at, "campaign launch scheduled");
        Ok(summary)
    }

    /// Launch: draft/ready → running.
    ///
    /// Validates, flips the status, initializes every pending contact's
    /// progress, and queues exactly one job per contact for its first email,
    /// all in one transaction. Later steps are queued by the worker as each
    /// send completes.
    pub async fn launch(&self, owner: OwnerId, id: CampaignId) -> Result<LaunchReport> {
        let mut tx = self.begin().await?;
        require_ready_on(&mut tx, owner, id, CampaignOp::Launch).await?;
        let campaign = transition_on(&mut tx, owner, id, CampaignOp::Launch).await?;

        let now = Utc::now();
        let started = start_sequences_on(&mut tx, id, now).await?;

        let mut report = LaunchReport {
            campaign,
            sequence_contacts: 0,
            template_contacts: 0,
            jobs_enqueued: 0,
        };

        for contact in &started {
            let (email_number, key) = match contact.sequence_len {
                Some(_) => {
                    report.sequence_contacts += 1;
                    (Some(1), sequence_step_key(id, contact.contact_id, 1))
                }
                None => {
                    report.template_contacts += 1;
                    (None, template_send_key(id, contact.contact_id))
                }
            };

            let payload = JobPayload::SendEmail(SendEmail {
                campaign_id: id,
                contact_id: contact.contact_id,
                email_number,
            });
            let job = insert_job(
                &mut tx,
                &NewJob::for_payload(&payload)
                    .run_at(now)
                    .idempotency_key(key)
                    .max_attempts(self.job_max_attempts),
            )
            .await?;
            if job.is_some() {
                report.jobs_enqueued += 1;
            }
        }

        tx.commit().await?;
        info!(
            campaign_id = %id,
            sequence_contacts = report.sequence_contacts,
            template_contacts = report.template_contacts,
            jobs = report.jobs_enqueued,
            "campaign launched"
        );
        Ok(report)
    }

    /// running → paused. Queued jobs stay queued; the worker defers them
    /// while the campaign is paused.
    pub async fn pause(&self, owner: OwnerId, id: CampaignId) -> Result<CampaignSummary> {
        self.transition(owner, id, CampaignOp::Pause).await
    }

    /// paused → running. If every contact settled while paused (replies,
    /// unsubscribes), the campaign completes right away.
    pub async fn resume(&self, owner: OwnerId, id: CampaignId) -> Result<CampaignSummary> {
        let mut tx = self.begin().await?;
        let mut summary = transition_on(&mut tx, owner, id, CampaignOp::Resume).await?;
        lock_campaign_on(&mut tx, id).await?;
        if complete_if_finished_on(&mut tx, id).await? {
            summary.status = CampaignStatus::Completed;
        }
        tx.commit().await?;
        Ok(summary)
    }

    /// Any non-terminal status → cancelled. Jobs still queued are skipped by
    /// the worker when they fire.
    pub async fn cancel(&self, owner: OwnerId, id: CampaignId) -> Result<CampaignSummary> {
        self.transition(owner, id, CampaignOp::Cancel).await
    }

    /// running → completed, on request.
    pub async fn complete_campaign(
        &self,
        owner: OwnerId,
        id: CampaignId,
    ) -> Result<CampaignSummary> {
        self.transition(owner, id, CampaignOp::Complete).await
    }

    /// Delete a draft, paused, or completed campaign and everything hanging
    /// off it: unsubscribe tokens, events, messages, sequence content, and
    /// contact mappings. Jobs are kept for audit.
    pub async fn delete_campaign(&self, owner: OwnerId, id: CampaignId) -> Result<()> {
        let mut tx = self.begin().await?;

        let current: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM campaigns WHERE id = $1 AND owner_id = $2 FOR UPDATE",
        )
        .bind(id.0)
        .bind(owner.0)
        .fetch_optional(&mut *tx)
        .await?;

        let status: CampaignStatus = current
            .ok_or_else(|| Error::NotFound(format!("campaign {id}")))?
            .0
            .parse()?;
        if !status.is_deletable() {
            return Err(Error::DeleteNotAllowed { status });
        }

        for table in [
            "unsubscribe_tokens",
            "campaign_events",
            "campaign_messages",
            "sequence_emails",
            "campaign_contacts",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE campaign_id = $1"))
                .bind(id.0)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM campaigns WHERE id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(campaign_id = %id, from = status.as_str(), "campaign deleted");
        Ok(())
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct CampaignRow {
    id: Uuid,
    owner_id: Uuid,
    name: String,
    status: String,
    subject: Option<String>,
    body: Option<String>,
    from_account_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CampaignRow {
    fn try_into_campaign(self) -> Result<Campaign> {
        let template = match (self.subject, self.body) {
            (Some(subject), Some(body)) => Some(Template { subject, body }),
            _ => None,
        };

        Ok(Campaign {
            id: CampaignId(self.id),
            owner_id: OwnerId(self.owner_id),
            name: self.name,
            status: self.status.parse()?,
            template,
            from_account_id: self.from_account_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
