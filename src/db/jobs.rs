//! Job queue: enqueue with idempotency keys, skip-locked claims, retry
//! bookkeeping, and recovery of claims abandoned by crashed workers.
//!
//! A claim is the only thing that keeps two workers off the same row.
//! Idempotency keys only stop logically identical work from being enqueued
//! twice; they say nothing about how often a job runs.

use std::time::Duration;

use super::progress::{fail_contact_on, lock_campaign_on};
use crate::error::{Error, Result};
use crate::model::job::*;
use crate::model::{CampaignId, JobId};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use sqlx::PgConnection;
use uuid::Uuid;

/// Postgres channel notified on every enqueue. Payload is the queue name.
pub const JOBS_READY_CHANNEL: &str = "jobs_ready";

const JOB_COLUMNS: &str = "id, queue, payload, run_at, attempts, max_attempts, status, idempotency_key, last_error, locked_at, created_at, updated_at";

/// Result of enqueueing a job.
#[derive(Debug)]
pub enum EnqueueResult {
    /// New row inserted with status `pending`.
    Created(Box<Job>),
    /// A row with this idempotency key already exists. Nothing was written.
    Duplicate { idempotency_key: String },
}

impl EnqueueResult {
    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// Outcome of a stale-claim sweep.
#[derive(Debug, Default)]
pub struct Reclaimed {
    /// Jobs put back to `pending`.
    pub requeued: u64,
    /// Jobs whose expired claim used up their last attempt. Now `failed`.
    pub exhausted: Vec<Job>,
    /// Contacts marked `failed` along with their exhausted send jobs.
    pub contacts_failed: u32,
}

/// Filters for listing jobs.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub queue: Option<String>,
    pub status: Option<JobStatus>,
    pub campaign_id: Option<CampaignId>,
    pub limit: i64,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            queue: None,
            status: None,
            campaign_id: None,
            limit: 50,
        }
    }
}

/// Insert a pending job on an existing connection or transaction.
///
/// Returns `None` when the idempotency key is already taken. The NOTIFY only
/// fires if the surrounding transaction commits.
pub(crate) async fn insert_job(conn: &mut PgConnection, new: &NewJob) -> Result<Option<Job>> {
    let row: Option<JobRow> = sqlx::query_as(&format!(
        "INSERT INTO jobs (id, queue, payload, run_at, max_attempts, status, idempotency_key, created_at, updated_at)
         VALUES ($1, $2, $3, COALESCE($4, now()), $5, 'pending', $6, now(), now())
         ON CONFLICT (idempotency_key) DO NOTHING
         RETURNING {JOB_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(&new.queue)
    .bind(&new.payload)
    .bind(new.run_at)
    .bind(new.max_attempts as i32)
    .bind(new.idempotency_key.as_deref())
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        metrics::jobs_enqueued().add(
            1,
            &[
                KeyValue::new("queue", new.queue.clone()),
                KeyValue::new("result", "duplicate"),
            ],
        );
        return Ok(None);
    };

    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(JOBS_READY_CHANNEL)
        .bind(&new.queue)
        .execute(&mut *conn)
        .await?;

    metrics::jobs_enqueued().add(
        1,
        &[
            KeyValue::new("queue", new.queue.clone()),
            KeyValue::new("result", "created"),
        ],
    );

    row.try_into_job().map(Some)
}

/// Mark a running job completed on an existing connection or transaction.
pub(crate) async fn complete_job(conn: &mut PgConnection, id: JobId) -> Result<Job> {
    let row: Option<JobRow> = sqlx::query_as(&format!(
        "UPDATE jobs SET status = 'completed', locked_at = NULL, updated_at = now()
         WHERE id = $1 AND status = 'running'
         RETURNING {JOB_COLUMNS}"
    ))
    .bind(id.0)
    .fetch_optional(&mut *conn)
    .await?;

    let job = row.ok_or(Error::JobNotRunning(id))?.try_into_job()?;
    record_queue_op(&job.queue, "complete");
    Ok(job)
}

/// If `id` is a send job, lock its campaign row and return the send.
///
/// Taken before the job row is touched, the same order [`Db::record_send`]
/// uses, so a terminal failure and its contact's failure commit together.
///
/// [`Db::record_send`]: super::Db::record_send
async fn lock_send_on(conn: &mut PgConnection, id: JobId) -> Result<Option<SendEmail>> {
    let row: Option<(String, serde_json::Value)> =
        sqlx::query_as("SELECT queue, payload FROM jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&mut *conn)
            .await?;
    let Some((queue, payload)) = row else {
        return Ok(None);
    };
    let Ok(JobPayload::SendEmail(send)) = JobPayload::decode(&queue, &payload) else {
        return Ok(None);
    };

    match lock_campaign_on(conn, send.campaign_id).await {
        Ok(_) => Ok(Some(send)),
        Err(Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn record_queue_op(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl super::Db {
    /// Enqueue a job. A colliding idempotency key makes this a no-op.
    pub async fn enqueue(&self, new: NewJob) -> Result<EnqueueResult> {
        let mut conn = self.pool.acquire().await?;
        match insert_job(&mut conn, &new).await? {
            Some(job) => Ok(EnqueueResult::Created(Box::new(job))),
            None => Ok(EnqueueResult::Duplicate {
                idempotency_key: new.idempotency_key.unwrap_or_default(),
            }),
        }
    }

    /// Claim the next due job on `queue`, oldest `run_at` first.
    ///
    /// Rows locked by another claimer are skipped, never waited on, so any
    /// number of workers can call this concurrently and each gets a
    /// different job.
    pub async fn fetch_next(&self, queue: &str) -> Result<Option<Job>> {
        let mut tx = self.begin().await?;

        let candidate: Option<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM jobs
             WHERE queue = $1 AND status = 'pending' AND run_at <= now()
             ORDER BY run_at ASC
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(queue)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id,)) = candidate else {
            tx.commit().await?;
            record_queue_op(queue, "claim_empty");
            return Ok(None);
        };

        let row: JobRow = sqlx::query_as(&format!(
            "UPDATE jobs SET status = 'running', locked_at = now(), updated_at = now()
             WHERE id = $1
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        record_queue_op(queue, "claim");
        row.try_into_job().map(Some)
    }

    /// Claim one specific pending job now, ignoring its `run_at`.
    /// Returns `None` if the job is not pending.
    pub async fn claim_job(&self, id: JobId) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE jobs SET status = 'running', locked_at = now(), updated_at = now()
             WHERE id = $1 AND status = 'pending'
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        let job = row.map(JobRow::try_into_job).transpose()?;
        if let Some(ref job) = job {
            record_queue_op(&job.queue, "claim");
        }
        Ok(job)
    }

    /// Mark a running job completed.
    pub async fn complete(&self, id: JobId) -> Result<Job> {
        let mut conn = self.pool.acquire().await?;
        complete_job(&mut conn, id).await
    }

    /// Record a failed attempt.
    ///
    /// Increments `attempts`. While attempts remain, the job goes back to
    /// `pending` and becomes claimable again after `backoff`; once
    /// `attempts` reaches `max_attempts` it is `failed` for good, and so is
    /// the contact of a send job, in the same transaction.
    pub async fn fail(&self, id: JobId, backoff: Duration, error: &str) -> Result<FailOutcome> {
        let mut tx = self.begin().await?;
        let send = lock_send_on(&mut tx, id).await?;

        let row: Option<(String, bool, i32, chrono::DateTime<chrono::Utc>)> = sqlx::query_as(
            "UPDATE jobs SET
                attempts = attempts + 1,
                status = CASE WHEN attempts + 1 >= max_attempts THEN 'failed' ELSE 'pending' END,
                run_at = CASE WHEN attempts + 1 >= max_attempts THEN run_at
                              ELSE now() + make_interval(secs => $2) END,
                last_error = $3,
                locked_at = NULL,
                updated_at = now()
             WHERE id = $1 AND status = 'running'
             RETURNING queue, status = 'failed', attempts, run_at",
        )
        .bind(id.0)
        .bind(backoff.as_secs_f64())
        .bind(error)
        .fetch_optional(&mut *tx)
        .await?;

        let (queue, exhausted, attempts, run_at) = row.ok_or(Error::JobNotRunning(id))?;
        let attempts = attempts as u32;

        if exhausted {
            if let Some(send) = send {
                fail_contact_on(&mut tx, &send, attempts, error).await?;
            }
            tx.commit().await?;
            record_queue_op(&queue, "dead");
            Ok(FailOutcome::PermanentlyFailed { attempts })
        } else {
            tx.commit().await?;
            record_queue_op(&queue, "retry");
            Ok(FailOutcome::Retrying { attempts, run_at })
        }
    }

    /// Fail a running job terminally, whatever its remaining attempts, along
    /// with the contact of a send job. Used for errors that retrying cannot
    /// fix.
    pub async fn bury(&self, id: JobId, error: &str) -> Result<FailOutcome> {
        let mut tx = self.begin().await?;
        let send = lock_send_on(&mut tx, id).await?;

        let row: Option<(String, i32)> = sqlx::query_as(
            "UPDATE jobs SET attempts = attempts + 1, status = 'failed', last_error = $2,
                locked_at = NULL, updated_at = now()
             WHERE id = $1 AND status = 'running'
             RETURNING queue, attempts",
        )
        .bind(id.0)
        .bind(error)
        .fetch_optional(&mut *tx)
        .await?;

        let (queue, attempts) = row.ok_or(Error::JobNotRunning(id))?;
        let attempts = attempts as u32;
        if let Some(send) = send {
            fail_contact_on(&mut tx, &send, attempts, error).await?;
        }
        tx.commit().await?;

        record_queue_op(&queue, "dead");
        Ok(FailOutcome::PermanentlyFailed { attempts })
    }

    /// Put a running job back to `pending` after `delay` without using up
    /// an attempt. For work that is blocked rather than broken.
    pub async fn defer(&self, id: JobId, delay: Duration) -> Result<Job> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE jobs SET status = 'pending', run_at = now() + make_interval(secs => $2),
                locked_at = NULL, updated_at = now()
             WHERE id = $1 AND status = 'running'
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(id.0)
        .bind(delay.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let job = row.ok_or(Error::JobNotRunning(id))?.try_into_job()?;
        record_queue_op(&job.queue, "defer");
        Ok(job)
    }

    /// Release claims older than `timeout`, left behind by workers that died
    /// between claim and completion. The expired claim counts as an attempt.
    ///
    /// A claim that used up the last attempt fails the job; a send job takes
    /// its contact down with it in the same transaction.
    pub async fn reclaim_stale(&self, timeout: Duration) -> Result<Reclaimed> {
        let secs = timeout.as_secs_f64();

        let requeued = sqlx::query(
            "UPDATE jobs SET status = 'pending', attempts = attempts + 1,
                last_error = 'claim expired', locked_at = NULL, updated_at = now()
             WHERE status = 'running'
               AND locked_at < now() - make_interval(secs => $1)
               AND attempts + 1 < max_attempts",
        )
        .bind(secs)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let candidates: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT id FROM jobs
             WHERE status = 'running'
               AND locked_at < now() - make_interval(secs => $1)
               AND attempts + 1 >= max_attempts",
        )
        .bind(secs)
        .fetch_all(&self.pool)
        .await?;

        let mut reclaimed = Reclaimed {
            requeued,
            ..Reclaimed::default()
        };

        for (id,) in candidates {
            let id = JobId(id);
            let mut tx = self.begin().await?;
            let send = lock_send_on(&mut tx, id).await?;

            // Re-checked under lock: the job may have finished meanwhile.
            let row: Option<JobRow> = sqlx::query_as(&format!(
                "UPDATE jobs SET status = 'failed', attempts = attempts + 1,
                    last_error = 'claim expired', locked_at = NULL, updated_at = now()
                 WHERE id = $1 AND status = 'running'
                   AND locked_at < now() - make_interval(secs => $2)
                 RETURNING {JOB_COLUMNS}"
            ))
            .bind(id.0)
            .bind(secs)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = row else {
                tx.rollback().await?;
                continue;
            };
            let job = row.try_into_job()?;
            if let Some(send) = send {
                if fail_contact_on(&mut tx, &send, job.attempts, "claim expired").await? {
                    reclaimed.contacts_failed += 1;
                }
            }
            tx.commit().await?;
            reclaimed.exhausted.push(job);
        }

        let total = reclaimed.requeued + reclaimed.exhausted.len() as u64;
        if total > 0 {
            metrics::queue_operations().add(
                total,
                &[
                    KeyValue::new("queue", "*"),
                    KeyValue::new("operation", "reclaim"),
                ],
            );
        }

        Ok(reclaimed)
    }

    /// Get a job by ID.
    pub async fn get_job(&self, id: JobId) -> Result<Job> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("job {id}")))?
            .try_into_job()
    }

    /// Look a job up by its idempotency key.
    pub async fn find_job_by_key(&self, key: &str) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE idempotency_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRow::try_into_job).transpose()
    }

    /// List jobs, newest first.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE ($1::text IS NULL OR queue = $1)
               AND ($2::text IS NULL OR status = $2)
               AND ($3::text IS NULL OR payload->>'campaignId' = $3)
             ORDER BY created_at DESC
             LIMIT $4"
        ))
        .bind(filter.queue.as_deref())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.campaign_id.map(|c| c.0.to_string()))
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::try_into_job).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    queue: String,
    payload: serde_json::Value,
    run_at: chrono::DateTime<chrono::Utc>,
    attempts: i32,
    max_attempts: i32,
    status: String,
    idempotency_key: Option<String>,
    last_error: Option<String>,
    locked_at: Option<chrono::DateTime<chrono::Utc>>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl JobRow {
    fn try_into_job(self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id),
            queue: self.queue,
            payload: self.payload,
            run_at: self.run_at,
            attempts: self.attempts as u32,
            max_attempts: self.max_attempts as u32,
            status: self.status.parse()?,
            idempotency_key: self.idempotency_key,
            last_error: self.last_error,
            locked_at: self.locked_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
