//! Job worker: listens for work, claims jobs, sends email, retires jobs.
//!
//! Every send re-reads the campaign status first, so pause and cancel take
//! effect on jobs that were queued before the transition. A paused campaign's
//! jobs are pushed back without spending an attempt; a cancelled or completed
//! campaign's jobs are completed without sending.

use crate::config::Config;
use crate::db::Db;
use crate::db::jobs::JOBS_READY_CHANNEL;
use crate::db::progress::{Advance, SentEmail};
use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::mailer::{Mailer, MailerError, render};
use crate::model::campaign::CampaignStatus;
use crate::model::job::{
    FailOutcome, Job, JobPayload, SCHEDULE_CAMPAIGN_QUEUE, SEND_EMAIL_QUEUE, ScheduleCampaign,
    SendEmail,
};
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, warn};

/// Longest delay between two attempts of the same job.
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queues this worker claims from, in priority order.
    pub queues: Vec<String>,
    /// Poll interval fallback when no NOTIFY arrives.
    pub poll_interval: Duration,
    /// Jobs handled at once.
    pub concurrency: usize,
    pub retry_backoff: Duration,
    pub stale_timeout: Duration,
    pub pause_recheck: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec![
                SCHEDULE_CAMPAIGN_QUEUE.to_string(),
                SEND_EMAIL_QUEUE.to_string(),
            ],
            poll_interval: Duration::from_secs(1),
            concurrency: 4,
            retry_backoff: Duration::from_secs(30),
            stale_timeout: Duration::from_secs(600),
            pause_recheck: Duration::from_secs(300),
        }
    }
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.worker_poll_interval,
            concurrency: config.worker_concurrency,
            retry_backoff: config.retry_backoff,
            stale_timeout: config.stale_job_timeout,
            pause_recheck: config.pause_recheck,
            ..Self::default()
        }
    }
}

/// Delay before retrying a job that has already failed `attempts` times:
/// `base * 2^attempts`, capped at [`MAX_BACKOFF`].
pub fn backoff(base: Duration, attempts: u32) -> Duration {
    let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
    base.checked_mul(factor)
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

/// How the worker retired a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// Email sent and progress advanced.
    Sent(Advance),
    /// Campaign paused; the job runs again later.
    Deferred,
    /// Completed without effect.
    Skipped(&'static str),
    /// Failed; another attempt is scheduled.
    Retrying,
    /// Failed for good. The contact (if any) is marked `failed`.
    Failed,
    /// Scheduled launch fired.
    Launched,
}

/// The worker loop: listen for jobs, run them, retire them.
pub struct Worker<M: Mailer> {
    db: Arc<Db>,
    mailer: Arc<M>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
    slots: Arc<Semaphore>,
}

impl<M: Mailer> Clone for Worker<M> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            mailer: Arc::clone(&self.mailer),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<M: Mailer> Worker<M> {
    pub fn new(db: Arc<Db>, mailer: Arc<M>, config: WorkerConfig) -> Self {
        let slots = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            db,
            mailer,
            config,
            shutdown: Arc::new(Notify::new()),
            slots,
        }
    }

    /// Signal the worker to stop claiming. In-flight jobs finish first.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run the worker loop until shutdown.
    pub async fn run(&self) -> Result<()> {
        let mut listener = sqlx::postgres::PgListener::connect_with(self.db.pool()).await?;
        listener.listen(JOBS_READY_CHANNEL).await?;

        let mut in_flight = JoinSet::new();
        info!(
            queues = ?self.config.queues,
            concurrency = self.config.concurrency,
            "worker started, listening for jobs"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!(in_flight = in_flight.len(), "worker shutting down");
                    break;
                }
                notif = listener.recv() => {
                    match notif {
                        Ok(n) => tracing::debug!(queue = n.payload(), "notified of new job"),
                        Err(e) => warn!("PgListener error: {e}, falling back to poll"),
                    }
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!("job task aborted: {e}");
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            if let Err(e) = self.sweep_stale().await {
                error!("stale sweep error: {e}");
            }
            if let Err(e) = self.dispatch(&mut in_flight).await {
                error!("dispatch error: {e}");
            }
        }

        while in_flight.join_next().await.is_some() {}
        Ok(())
    }

    /// Claim jobs while there is capacity and spawn a task for each.
    async fn dispatch(&self, in_flight: &mut JoinSet<()>) -> Result<()> {
        loop {
            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                return Ok(());
            };
            let Some(job) = self.claim_any().await? else {
                return Ok(());
            };

            let worker = self.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                let job_id = job.id;
                if let Err(e) = worker.process_job(job).await {
                    // The claim expires and the job is reclaimed.
                    error!(job_id = %job_id, code = e.code(), "job handling error: {e}");
                }
            });
        }
    }

    async fn claim_any(&self) -> Result<Option<Job>> {
        for queue in &self.config.queues {
            if let Some(job) = self.db.fetch_next(queue).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Return expired claims to the queue. A send job whose expired claim
    /// was its last attempt takes its contact down with it.
    async fn sweep_stale(&self) -> Result<()> {
        let reclaimed = self.db.reclaim_stale(self.config.stale_timeout).await?;
        if !reclaimed.exhausted.is_empty() {
            warn!(
                jobs = reclaimed.exhausted.len(),
                contacts = reclaimed.contacts_failed,
                "stale claims exhausted their attempts"
            );
        }
        Ok(())
    }

    /// Handle one claimed job and retire it.
    pub async fn process_job(&self, job: Job) -> Result<Handled> {
        let span = start_job_span(&job.queue, job.id, job.attempts + 1);
        let queue = job.queue.clone();
        let started = Instant::now();

        let handled = async {
            record_state_transition(&span, "pending", "running");
            let handled = match JobPayload::decode(&job.queue, &job.payload) {
                Ok(JobPayload::SendEmail(p)) => self.send_email(&job, p).await?,
                Ok(JobPayload::ScheduleCampaign(p)) => self.launch_scheduled(&job, p).await?,
                Err(e) => {
                    warn!(job_id = %job.id, "undecodable payload, parking job: {e}");
                    metrics::jobs_undecodable().add(1, &[KeyValue::new("queue", job.queue.clone())]);
                    self.db.bury(job.id, &e.to_string()).await?;
                    Handled::Failed
                }
            };
            record_state_transition(&span, "running", retired_state(&handled));
            Ok::<_, Error>(handled)
        }
        .instrument(span.clone())
        .await?;

        metrics::job_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("queue", queue)],
        );
        Ok(handled)
    }

    async fn send_email(&self, job: &Job, p: SendEmail) -> Result<Handled> {
        match self.db.campaign_status(p.campaign_id).await? {
            Some(CampaignStatus::Running) => {}
            Some(CampaignStatus::Paused) => {
                self.db.defer(job.id, self.config.pause_recheck).await?;
                info!(campaign_id = %p.campaign_id, "campaign paused, send deferred");
                return Ok(Handled::Deferred);
            }
            Some(status) => {
                return self.skip(job, status.as_str()).await;
            }
            None => return self.skip(job, "campaign_gone").await,
        }

        let contact = match self.db.get_campaign_contact(p.campaign_id, p.contact_id).await {
            Ok(contact) => contact,
            Err(Error::NotFound(_)) => return self.skip(job, "contact_gone").await,
            Err(e) => return Err(e),
        };
        let email_number = p.email_number.unwrap_or(1);
        if contact.status.is_terminal() {
            return self.skip(job, contact.status.as_str()).await;
        }
        if contact.current_email_number != email_number {
            // An earlier run of this job already sent and advanced.
            return self.skip(job, "already_sent").await;
        }

        let outgoing = match self
            .db
            .outgoing_email(p.campaign_id, p.contact_id, p.email_number)
            .await
        {
            Ok(outgoing) => outgoing,
            Err(e @ Error::Database(_)) => return Err(e),
            Err(e) => {
                return self
                    .give_up(job, p, MailerError::Permanent(e.to_string()))
                    .await;
            }
        };

        let subject = render(
            &outgoing.subject,
            outgoing.first_name.as_deref(),
            &outgoing.to,
            outgoing.unsubscribe_token,
        );
        let html = render(
            &outgoing.body,
            outgoing.first_name.as_deref(),
            &outgoing.to,
            outgoing.unsubscribe_token,
        );

        let sent = match self
            .mailer
            .send(outgoing.from_account_id, &outgoing.to, &subject, &html)
            .await
        {
            Ok(sent) => sent,
            Err(e) if e.is_retryable() => return self.retry(job, p, e).await,
            Err(e) => return self.give_up(job, p, e).await,
        };

        let advance = self
            .db
            .record_send(&SentEmail {
                job_id: job.id,
                campaign_id: p.campaign_id,
                contact_id: p.contact_id,
                email_number,
                provider_message_id: sent.provider_message_id.clone(),
                subject,
            })
            .await?;

        metrics::emails().add(1, &[KeyValue::new("result", "sent")]);
        info!(
            campaign_id = %p.campaign_id,
            contact_id = %p.contact_id,
            email_number,
            message_id = %sent.provider_message_id,
            advance = ?advance,
            "email sent"
        );
        Ok(Handled::Sent(advance))
    }

    async fn retry(&self, job: &Job, p: SendEmail, e: MailerError) -> Result<Handled> {
        let email_number = p.email_number.unwrap_or(1);
        let delay = backoff(self.config.retry_backoff, job.attempts);

        match self.db.fail(job.id, delay, &e.to_string()).await? {
            FailOutcome::Retrying { attempts, run_at } => {
                metrics::emails().add(1, &[KeyValue::new("result", "retryable")]);
                warn!(
                    campaign_id = %p.campaign_id,
                    contact_id = %p.contact_id,
                    attempts,
                    retry_at = %run_at,
                    "send failed, will retry: {e}"
                );
                self.db
                    .record_event(
                        p.campaign_id,
                        Some(p.contact_id),
                        &EventKind::EmailFailed {
                            email_number,
                            error: e.to_string(),
                            attempt: attempts,
                            retryable: true,
                        },
                    )
                    .await?;
                Ok(Handled::Retrying)
            }
            FailOutcome::PermanentlyFailed { attempts } => {
                self.log_failure(p, attempts, &e);
                Ok(Handled::Failed)
            }
        }
    }

    async fn give_up(&self, job: &Job, p: SendEmail, e: MailerError) -> Result<Handled> {
        let attempts = match self.db.bury(job.id, &e.to_string()).await? {
            FailOutcome::PermanentlyFailed { attempts } | FailOutcome::Retrying { attempts, .. } => {
                attempts
            }
        };
        self.log_failure(p, attempts, &e);
        Ok(Handled::Failed)
    }

    /// The queue already failed the contact along with the job.
    fn log_failure(&self, p: SendEmail, attempts: u32, e: &MailerError) {
        metrics::emails().add(1, &[KeyValue::new("result", "permanent")]);
        error!(
            campaign_id = %p.campaign_id,
            contact_id = %p.contact_id,
            attempts,
            "send failed for good: {e}"
        );
    }

    async fn skip(&self, job: &Job, reason: &'static str) -> Result<Handled> {
        self.db.complete(job.id).await?;
        metrics::emails().add(1, &[KeyValue::new("result", "skipped")]);
        info!(job_id = %job.id, reason, "send skipped");
        Ok(Handled::Skipped(reason))
    }

    async fn launch_scheduled(&self, job: &Job, p: ScheduleCampaign) -> Result<Handled> {
        match self.db.launch(p.owner_id, p.campaign_id).await {
            Ok(report) => {
                self.db.complete(job.id).await?;
                info!(
                    campaign_id = %p.campaign_id,
                    jobs = report.jobs_enqueued,
                    "scheduled launch fired"
                );
                Ok(Handled::Launched)
            }
            Err(e @ (Error::IllegalTransition { .. } | Error::NotFound(_))) => {
                self.db.complete(job.id).await?;
                info!(campaign_id = %p.campaign_id, "scheduled launch dropped: {e}");
                Ok(Handled::Skipped("launch_not_applicable"))
            }
            Err(e @ Error::ValidationFailed(_)) => {
                self.db.bury(job.id, &e.to_string()).await?;
                warn!(campaign_id = %p.campaign_id, "scheduled launch failed validation: {e}");
                Ok(Handled::Failed)
            }
            Err(e) => {
                let delay = backoff(self.config.retry_backoff, job.attempts);
                match self.db.fail(job.id, delay, &e.to_string()).await? {
                    FailOutcome::Retrying { .. } => Ok(Handled::Retrying),
                    FailOutcome::PermanentlyFailed { .. } => Ok(Handled::Failed),
                }
            }
        }
    }
}

fn retired_state(handled: &Handled) -> &'static str {
    match handled {
        Handled::Sent(_) | Handled::Skipped(_) | Handled::Launched => "completed",
        Handled::Deferred | Handled::Retrying => "pending",
        Handled::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_secs(30);
        assert_eq!(backoff(base, 0), Duration::from_secs(30));
        assert_eq!(backoff(base, 1), Duration::from_secs(60));
        assert_eq!(backoff(base, 4), Duration::from_secs(480));
    }

    #[test]
    fn backoff_is_capped_at_one_day() {
        let base = Duration::from_secs(30);
        assert_eq!(backoff(base, 20), MAX_BACKOFF);
        assert_eq!(backoff(base, 40), MAX_BACKOFF);
    }

    #[test]
    fn default_config_claims_launches_before_sends() {
        let config = WorkerConfig::default();
        assert_eq!(config.queues, vec!["schedule-campaign", "send-email"]);
    }

    #[test]
    fn retired_state_matches_job_status() {
        assert_eq!(retired_state(&Handled::Deferred), "pending");
        assert_eq!(retired_state(&Handled::Skipped("paused")), "completed");
        assert_eq!(retired_state(&Handled::Failed), "failed");
    }
}
