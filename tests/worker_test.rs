//! Worker behaviour against a real Postgres with a scripted mailer.
//!
//! Serial: `Worker::run` claims from the shared queues.

mod common;

use common::{Seed, sequence, test_db};
use outreach::db::Db;
use outreach::db::progress::{Advance, SentEmail, next_run_at};
use outreach::engine::WorkerConfig;
use outreach::engine::worker::{Handled, Worker};
use outreach::event::EventKind;
use outreach::mailer::{Mailer, MailerError, SentMessage};
use outreach::model::campaign::CampaignStatus;
use outreach::model::contact::ContactStatus;
use outreach::model::job::{
    Job, JobStatus, NewJob, SEND_EMAIL_QUEUE, scheduled_launch_key, sequence_step_key,
    template_send_key,
};
use serde_json::json;
use serial_test::serial;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
enum Script {
    Accept,
    Retryable,
    Permanent,
}

#[derive(Debug, Clone)]
struct Delivered {
    to: String,
    subject: String,
    html: String,
}

struct ScriptedMailer {
    script: Script,
    delivered: Mutex<Vec<Delivered>>,
}

impl ScriptedMailer {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            delivered: Mutex::new(Vec::new()),
        })
    }

    fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().unwrap().clone()
    }
}

impl Mailer for ScriptedMailer {
    async fn send(
        &self,
        _account_id: Uuid,
        to: &str,
        subject: &str,
        html: &str,
    ) -> Result<SentMessage, MailerError> {
        match self.script {
            Script::Accept => {
                self.delivered.lock().unwrap().push(Delivered {
                    to: to.to_string(),
                    subject: subject.to_string(),
                    html: html.to_string(),
                });
                Ok(SentMessage {
                    provider_message_id: format!("msg-{}", Uuid::new_v4()),
                })
            }
            Script::Retryable => Err(MailerError::Retryable("429 rate limited".into())),
            Script::Permanent => Err(MailerError::Permanent("550 no such user".into())),
        }
    }

    async fn verify_credentials(&self, _account_id: Uuid) -> Result<(), MailerError> {
        Ok(())
    }
}

fn config() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(100),
        retry_backoff: Duration::from_secs(60),
        ..WorkerConfig::default()
    }
}

async fn claim(db: &Db, key: &str) -> Job {
    let job = db
        .find_job_by_key(key)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("no job with key {key}"));
    db.claim_job(job.id).await.unwrap().expect("job was pending")
}

#[tokio::test]
#[ignore] // Requires running Postgres
#[serial]
async fn sending_step_one_queues_step_two_at_its_offset() {
    let db = Arc::new(test_db().await);
    let seeded = Seed::new().contacts(1).create(&db).await;
    let (owner, id, contact) = (seeded.owner, seeded.campaign, seeded.contacts[0]);
    db.save_sequence(owner, id, contact, &sequence(4)).await.unwrap();
    db.launch(owner, id).await.unwrap();

    let mailer = ScriptedMailer::new(Script::Accept);
    let worker = Worker::new(Arc::clone(&db), Arc::clone(&mailer), config());

    let job = claim(&db, &sequence_step_key(id, contact, 1)).await;
    let handled = worker.process_job(job.clone()).await.unwrap();

    let progress = db.get_campaign_contact(id, contact).await.unwrap();
    let started = progress.sequence_started_at.unwrap();
    let Handled::Sent(Advance::Next {
        email_number,
        run_at,
        job_id,
    }) = handled
    else {
        panic!("unexpected {handled:?}");
    };
    assert_eq!(email_number, 2);
    assert_eq!(run_at, next_run_at(started, 3));
    assert!(job_id.is_some());

    assert_eq!(progress.current_email_number, 2);
    assert_eq!(progress.status, ContactStatus::InProgress);
    assert_eq!(progress.next_email_send_at, Some(run_at));
    assert!(progress.last_email_sent_at.is_some());

    let next = db
        .find_job_by_key(&sequence_step_key(id, contact, 2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.run_at, run_at);
    assert_eq!(db.get_job(job.id).await.unwrap().status, JobStatus::Completed);

    let delivered = mailer.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].to, "lead0@example.com");
    assert_eq!(delivered[0].subject, "Step 1 for Ada");
    assert!(!delivered[0].html.contains("{{"));
}

#[tokio::test]
#[ignore] // Requires running Postgres
#[serial]
async fn last_step_completes_contact_and_campaign() {
    let db = Arc::new(test_db().await);
    let seeded = Seed::new().contacts(1).create(&db).await;
    let (owner, id, contact) = (seeded.owner, seeded.campaign, seeded.contacts[0]);
    db.save_sequence(owner, id, contact, &sequence(2)).await.unwrap();
    db.launch(owner, id).await.unwrap();

    let mailer = ScriptedMailer::new(Script::Accept);
    let worker = Worker::new(Arc::clone(&db), Arc::clone(&mailer), config());

    let first = claim(&db, &sequence_step_key(id, contact, 1)).await;
    worker.process_job(first).await.unwrap();
    // Step 2 is due in three days; claim it directly.
    let second = claim(&db, &sequence_step_key(id, contact, 2)).await;
    let handled = worker.process_job(second).await.unwrap();

    assert_eq!(
        handled,
        Handled::Sent(Advance::Finished {
            total_emails: 2,
            campaign_completed: true,
        })
    );
    let progress = db.get_campaign_contact(id, contact).await.unwrap();
    assert_eq!(progress.status, ContactStatus::Completed);
    assert!(progress.is_sequence_done());
    assert_eq!(
        db.get_campaign(owner, id).await.unwrap().status,
        CampaignStatus::Completed
    );
    assert!(
        db.find_job_by_key(&sequence_step_key(id, contact, 3))
            .await
            .unwrap()
            .is_none()
    );

    let kinds: Vec<&'static str> = db
        .list_events(id, 0)
        .await
        .unwrap()
        .iter()
        .map(|e| e.kind.name())
        .collect();
    assert_eq!(
        &kinds[kinds.len() - 4..],
        &["email_sent", "email_sent", "sequence_completed", "auto_completed"]
    );
}

#[tokio::test]
#[ignore] // Requires running Postgres
#[serial]
async fn template_contact_gets_one_rendered_email() {
    let db = Arc::new(test_db().await);
    let seeded = Seed::new().contacts(1).create(&db).await;
    let (owner, id, contact) = (seeded.owner, seeded.campaign, seeded.contacts[0]);
    db.launch(owner, id).await.unwrap();

    let mailer = ScriptedMailer::new(Script::Accept);
    let worker = Worker::new(Arc::clone(&db), Arc::clone(&mailer), config());

    let job = claim(&db, &template_send_key(id, contact)).await;
    let handled = worker.process_job(job).await.unwrap();
    assert!(matches!(
        handled,
        Handled::Sent(Advance::Finished { total_emails: 1, .. })
    ));

    let delivered = mailer.delivered();
    assert_eq!(delivered[0].subject, "Hi Ada");
    assert_eq!(delivered[0].html, "<p>Hello Ada</p>");
}

#[tokio::test]
#[ignore] // Requires running Postgres
#[serial]
async fn paused_campaign_defers_without_spending_an_attempt() {
    let db = Arc::new(test_db().await);
    let seeded = Seed::new().contacts(1).create(&db).await;
    let (owner, id, contact) = (seeded.owner, seeded.campaign, seeded.contacts[0]);
    db.launch(owner, id).await.unwrap();
    db.pause(owner, id).await.unwrap();

    let mailer = ScriptedMailer::new(Script::Accept);
    let worker = Worker::new(Arc::clone(&db), Arc::clone(&mailer), config());

    let job = claim(&db, &template_send_key(id, contact)).await;
    let handled = worker.process_job(job.clone()).await.unwrap();
    assert_eq!(handled, Handled::Deferred);

    let stored = db.get_job(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.attempts, 0);
    assert!(stored.run_at > chrono::Utc::now() + chrono::Duration::minutes(4));
    assert!(mailer.delivered().is_empty());
}

#[tokio::test]
#[ignore] // Requires running Postgres
#[serial]
async fn cancelled_campaign_skips_queued_sends() {
    let db = Arc::new(test_db().await);
    let seeded = Seed::new().contacts(1).create(&db).await;
    let (owner, id, contact) = (seeded.owner, seeded.campaign, seeded.contacts[0]);
    db.launch(owner, id).await.unwrap();
    db.cancel(owner, id).await.unwrap();

    let mailer = ScriptedMailer::new(Script::Accept);
    let worker = Worker::new(Arc::clone(&db), Arc::clone(&mailer), config());

    let job = claim(&db, &template_send_key(id, contact)).await;
    let handled = worker.process_job(job.clone()).await.unwrap();
    assert_eq!(handled, Handled::Skipped("cancelled"));
    assert_eq!(db.get_job(job.id).await.unwrap().status, JobStatus::Completed);
    assert!(mailer.delivered().is_empty());
}

#[tokio::test]
#[ignore] // Requires running Postgres
#[serial]
async fn settled_contact_is_not_emailed() {
    let db = Arc::new(test_db().await);
    let seeded = Seed::new().contacts(2).create(&db).await;
    let (owner, id, contact) = (seeded.owner, seeded.campaign, seeded.contacts[0]);
    db.launch(owner, id).await.unwrap();
    db.record_contact_outcome(owner, id, contact, ContactStatus::Unsubscribed)
        .await
        .unwrap();

    let mailer = ScriptedMailer::new(Script::Accept);
    let worker = Worker::new(Arc::clone(&db), Arc::clone(&mailer), config());

    let job = claim(&db, &template_send_key(id, contact)).await;
    let handled = worker.process_job(job).await.unwrap();
    assert_eq!(handled, Handled::Skipped("unsubscribed"));
    assert!(mailer.delivered().is_empty());
}

#[tokio::test]
#[ignore] // Requires running Postgres
#[serial]
async fn permanent_failure_fails_job_and_contact() {
    let db = Arc::new(test_db().await);
    let seeded = Seed::new().contacts(1).create(&db).await;
    let (owner, id, contact) = (seeded.owner, seeded.campaign, seeded.contacts[0]);
    db.launch(owner, id).await.unwrap();

    let worker = Worker::new(
        Arc::clone(&db),
        ScriptedMailer::new(Script::Permanent),
        config(),
    );

    let job = claim(&db, &template_send_key(id, contact)).await;
    let handled = worker.process_job(job.clone()).await.unwrap();
    assert_eq!(handled, Handled::Failed);

    let stored = db.get_job(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.last_error.unwrap().contains("550"));

    let progress = db.get_campaign_contact(id, contact).await.unwrap();
    assert_eq!(progress.status, ContactStatus::Failed);
    // The only contact settled, so the campaign is done.
    assert_eq!(
        db.get_campaign(owner, id).await.unwrap().status,
        CampaignStatus::Completed
    );
}

#[tokio::test]
#[ignore] // Requires running Postgres
#[serial]
async fn retryable_failure_backs_off_and_records_event() {
    let db = Arc::new(test_db().await);
    let seeded = Seed::new().contacts(1).create(&db).await;
    let (owner, id, contact) = (seeded.owner, seeded.campaign, seeded.contacts[0]);
    db.launch(owner, id).await.unwrap();

    let worker = Worker::new(
        Arc::clone(&db),
        ScriptedMailer::new(Script::Retryable),
        config(),
    );

    let job = claim(&db, &template_send_key(id, contact)).await;
    let handled = worker.process_job(job.clone()).await.unwrap();
    assert_eq!(handled, Handled::Retrying);

    let stored = db.get_job(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.attempts, 1);
    assert!(stored.run_at > chrono::Utc::now() + chrono::Duration::seconds(50));

    let progress = db.get_campaign_contact(id, contact).await.unwrap();
    assert_eq!(progress.status, ContactStatus::InProgress);

    let events = db.list_events(id, 0).await.unwrap();
    assert!(matches!(
        events.last().unwrap().kind,
        EventKind::EmailFailed {
            retryable: true,
            attempt: 1,
            ..
        }
    ));
}

#[tokio::test]
#[ignore] // Requires running Postgres
#[serial]
async fn exhausted_retries_fail_the_contact() {
    let db = Arc::new(test_db().await.with_job_max_attempts(1));
    let seeded = Seed::new().contacts(1).create(&db).await;
    let (owner, id, contact) = (seeded.owner, seeded.campaign, seeded.contacts[0]);
    db.launch(owner, id).await.unwrap();

    let worker = Worker::new(
        Arc::clone(&db),
        ScriptedMailer::new(Script::Retryable),
        config(),
    );

    let job = claim(&db, &template_send_key(id, contact)).await;
    assert_eq!(job.max_attempts, 1);
    let handled = worker.process_job(job.clone()).await.unwrap();
    assert_eq!(handled, Handled::Failed);
    assert_eq!(db.get_job(job.id).await.unwrap().status, JobStatus::Failed);
    assert_eq!(
        db.get_campaign_contact(id, contact).await.unwrap().status,
        ContactStatus::Failed
    );
}

#[tokio::test]
#[ignore] // Requires running Postgres
#[serial]
async fn sweep_fails_contact_of_an_abandoned_last_attempt() {
    let db = Arc::new(test_db().await.with_job_max_attempts(1));
    let seeded = Seed::new().contacts(1).create(&db).await;
    let (owner, id, contact) = (seeded.owner, seeded.campaign, seeded.contacts[0]);
    db.launch(owner, id).await.unwrap();

    // Claimed by a worker that died before finishing.
    let job = claim(&db, &template_send_key(id, contact)).await;
    sqlx::query("UPDATE jobs SET locked_at = now() - interval '1 hour' WHERE id = $1")
        .bind(job.id.0)
        .execute(db.pool())
        .await
        .unwrap();

    let reclaimed = db.reclaim_stale(Duration::from_secs(60)).await.unwrap();
    assert!(reclaimed.exhausted.iter().any(|j| j.id == job.id));
    assert!(reclaimed.contacts_failed >= 1);

    // Nothing else has to run for the contact and campaign to settle.
    assert_eq!(db.get_job(job.id).await.unwrap().status, JobStatus::Failed);
    assert_eq!(
        db.get_campaign_contact(id, contact).await.unwrap().status,
        ContactStatus::Failed
    );
    let campaign = db.get_campaign(owner, id).await.unwrap();
    assert_eq!(campaign.status, CampaignStatus::Completed);

    let again = db.reclaim_stale(Duration::from_secs(60)).await.unwrap();
    assert!(again.exhausted.iter().all(|j| j.id != job.id));
}

#[tokio::test]
#[ignore] // Requires running Postgres
#[serial]
async fn send_recorded_off_cursor_logs_nothing() {
    let db = Arc::new(test_db().await);
    let seeded = Seed::new().contacts(1).create(&db).await;
    let (owner, id, contact) = (seeded.owner, seeded.campaign, seeded.contacts[0]);
    db.save_sequence(owner, id, contact, &sequence(3)).await.unwrap();
    db.launch(owner, id).await.unwrap();

    let job = claim(&db, &sequence_step_key(id, contact, 1)).await;
    let advance = db
        .record_send(&SentEmail {
            job_id: job.id,
            campaign_id: id,
            contact_id: contact,
            email_number: 2,
            provider_message_id: "msg-late".to_string(),
            subject: "Step 2".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(advance, Advance::Stale);
    assert_eq!(db.get_job(job.id).await.unwrap().status, JobStatus::Completed);

    let (messages,): (i64,) =
        sqlx::query_as("SELECT count(*) FROM campaign_messages WHERE campaign_id = $1")
            .bind(id.0)
            .fetch_one(db.pool())
            .await
            .unwrap();
    assert_eq!(messages, 0);
    let events = db.list_events(id, 0).await.unwrap();
    assert!(!events.iter().any(|e| matches!(e.kind, EventKind::EmailSent { .. })));

    let progress = db.get_campaign_contact(id, contact).await.unwrap();
    assert_eq!(progress.current_email_number, 1);
}

#[tokio::test]
#[ignore] // Requires running Postgres
#[serial]
async fn undecodable_payload_is_parked() {
    let db = Arc::new(test_db().await);
    let key = format!("bogus-{}", Uuid::new_v4());
    db.enqueue(NewJob::new(SEND_EMAIL_QUEUE, json!({ "campaign": "nope" })).idempotency_key(&key))
        .await
        .unwrap();

    let worker = Worker::new(
        Arc::clone(&db),
        ScriptedMailer::new(Script::Accept),
        config(),
    );

    let job = claim(&db, &key).await;
    let handled = worker.process_job(job.clone()).await.unwrap();
    assert_eq!(handled, Handled::Failed);

    let stored = db.get_job(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.last_error.unwrap().starts_with("bad job payload"));
}

#[tokio::test]
#[ignore] // Requires running Postgres
#[serial]
async fn scheduled_launch_fires_once() {
    let db = Arc::new(test_db().await);
    let seeded = Seed::new().contacts(2).create(&db).await;
    let (owner, id) = (seeded.owner, seeded.campaign);
    db.schedule(owner, id, chrono::Utc::now()).await.unwrap();

    let worker = Worker::new(
        Arc::clone(&db),
        ScriptedMailer::new(Script::Accept),
        config(),
    );

    let job = claim(&db, &scheduled_launch_key(id)).await;
    assert_eq!(worker.process_job(job).await.unwrap(), Handled::Launched);
    assert_eq!(
        db.get_campaign(owner, id).await.unwrap().status,
        CampaignStatus::Running
    );
    for contact in &seeded.contacts {
        assert!(
            db.find_job_by_key(&template_send_key(id, *contact))
                .await
                .unwrap()
                .is_some()
        );
    }
}

#[tokio::test]
#[ignore] // Requires running Postgres
#[serial]
async fn scheduled_launch_of_cancelled_campaign_is_dropped() {
    let db = Arc::new(test_db().await);
    let seeded = Seed::new().contacts(1).create(&db).await;
    let (owner, id) = (seeded.owner, seeded.campaign);
    db.schedule(owner, id, chrono::Utc::now()).await.unwrap();
    db.cancel(owner, id).await.unwrap();

    let worker = Worker::new(
        Arc::clone(&db),
        ScriptedMailer::new(Script::Accept),
        config(),
    );

    let job = claim(&db, &scheduled_launch_key(id)).await;
    assert_eq!(
        worker.process_job(job.clone()).await.unwrap(),
        Handled::Skipped("launch_not_applicable")
    );
    assert_eq!(db.get_job(job.id).await.unwrap().status, JobStatus::Completed);
    assert_eq!(
        db.get_campaign(owner, id).await.unwrap().status,
        CampaignStatus::Cancelled
    );
}

#[tokio::test]
#[ignore] // Requires running Postgres
#[serial]
async fn run_loop_drains_a_campaign_and_shuts_down() {
    let db = Arc::new(test_db().await);
    let seeded = Seed::new().contacts(3).create(&db).await;
    let (owner, id) = (seeded.owner, seeded.campaign);

    let mailer = ScriptedMailer::new(Script::Accept);
    let worker = Worker::new(Arc::clone(&db), Arc::clone(&mailer), config());
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    db.launch(owner, id).await.unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let status = db.get_campaign(owner, id).await.unwrap().status;
            if status == CampaignStatus::Completed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    assert!(completed.is_ok(), "campaign did not complete");

    worker.shutdown();
    handle.await.unwrap().unwrap();

    let ours: Vec<_> = mailer
        .delivered()
        .into_iter()
        .filter(|d| d.subject == "Hi Ada")
        .collect();
    assert!(ours.len() >= 3);
}
