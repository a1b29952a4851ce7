//! outreach CLI: operator interface to the campaign orchestration core.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use outreach::config::Config;
use outreach::config::secrets::ExposeSecret;
use outreach::db::Db;
use outreach::db::jobs::JobFilter;
use outreach::engine::{Worker, WorkerConfig};
use outreach::mailer::LogMailer;
use outreach::model::campaign::CampaignSummary;
use outreach::model::job::JobStatus;
use outreach::model::{CampaignId, JobId, OwnerId};
use outreach::telemetry::{TelemetryConfig, init_telemetry};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "outreach", about = "Email campaign orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply database migrations
    Migrate,
    /// Run the job worker (dry-run mailer: logs instead of sending)
    Serve {
        /// Override WORKER_CONCURRENCY
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Campaign lifecycle operations
    Campaign {
        /// Owner the campaign belongs to
        #[arg(long, global = true)]
        owner: Option<OwnerId>,
        #[command(subcommand)]
        action: CampaignAction,
    },
    /// Job queue inspection
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
}

#[derive(Subcommand)]
enum CampaignAction {
    /// Show a campaign, its contacts, and recent events
    Show { id: CampaignId },
    /// Report whether a campaign could launch
    Validate { id: CampaignId },
    /// draft → ready
    Ready { id: CampaignId },
    /// Mark ready and launch at a given time
    Schedule {
        id: CampaignId,
        /// RFC 3339 timestamp, e.g. 2026-11-01T09:00:00Z
        #[arg(long)]
        at: DateTime<Utc>,
    },
    /// Start sending
    Launch { id: CampaignId },
    Pause { id: CampaignId },
    Resume { id: CampaignId },
    Cancel { id: CampaignId },
    Complete { id: CampaignId },
    /// Delete a draft, paused, or completed campaign
    Delete { id: CampaignId },
}

#[derive(Subcommand)]
enum JobsAction {
    /// List jobs
    List {
        #[arg(long)]
        queue: Option<String>,
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long)]
        campaign: Option<CampaignId>,
        /// Maximum jobs to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a job
    Show { id: JobId },
    /// Return expired claims to the queue
    Reclaim {
        /// Override STALE_JOB_TIMEOUT_SECS
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Migrate => {
            let db = Db::connect(config.database_url.expose_secret()).await?;
            db.migrate().await?;
            println!("Migrations applied.");
            Ok(())
        }
        Command::Serve { concurrency } => cmd_serve(config, concurrency).await,
        Command::Campaign { owner, action } => {
            let owner = owner.ok_or_else(|| anyhow::anyhow!("--owner is required"))?;
            let db = Db::connect(config.database_url.expose_secret())
                .await?
                .with_job_max_attempts(config.job_max_attempts);
            cmd_campaign(&db, owner, action).await
        }
        Command::Jobs { action } => {
            let db = Db::connect(config.database_url.expose_secret()).await?;
            cmd_jobs(&db, &config, action).await
        }
    }
}

async fn cmd_serve(config: Config, concurrency: Option<usize>) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig::new(
        config.otel_endpoint.clone(),
        config.log_level.clone(),
    ))?;

    let mut worker_config = WorkerConfig::from_config(&config);
    if let Some(n) = concurrency {
        worker_config.concurrency = n.max(1);
    }

    // One connection per in-flight job, plus the listener and the claim loop.
    let db = Db::connect_with(
        config.database_url.expose_secret(),
        worker_config.concurrency as u32 + 2,
    )
    .await?
    .with_job_max_attempts(config.job_max_attempts);
    db.migrate().await?;

    let worker = Worker::new(Arc::new(db), Arc::new(LogMailer), worker_config);

    let w = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        w.shutdown();
    });

    worker.run().await?;
    Ok(())
}

async fn cmd_campaign(db: &Db, owner: OwnerId, action: CampaignAction) -> anyhow::Result<()> {
    match action {
        CampaignAction::Show { id } => cmd_campaign_show(db, owner, id).await,
        CampaignAction::Validate { id } => {
            let readiness = db.validate(owner, id).await?;
            if readiness.valid {
                println!("Valid: campaign {id} can launch.");
            } else {
                println!("Invalid:");
                for reason in &readiness.reasons {
                    println!("  {}", reason.code());
                }
            }
            Ok(())
        }
        CampaignAction::Ready { id } => print_summary(db.mark_ready(owner, id).await?),
        CampaignAction::Schedule { id, at } => {
            print_summary(db.schedule(owner, id, at).await?)?;
            println!("Launch scheduled for {at}.");
            Ok(())
        }
        CampaignAction::Launch { id } => {
            let report = db.launch(owner, id).await?;
            print_summary(report.campaign)?;
            println!(
                "Started {} sequence and {} template contact(s); {} job(s) queued.",
                report.sequence_contacts, report.template_contacts, report.jobs_enqueued
            );
            Ok(())
        }
        CampaignAction::Pause { id } => print_summary(db.pause(owner, id).await?),
        CampaignAction::Resume { id } => print_summary(db.resume(owner, id).await?),
        CampaignAction::Cancel { id } => print_summary(db.cancel(owner, id).await?),
        CampaignAction::Complete { id } => print_summary(db.complete_campaign(owner, id).await?),
        CampaignAction::Delete { id } => {
            db.delete_campaign(owner, id).await?;
            println!("Deleted: {id}");
            Ok(())
        }
    }
}

fn print_summary(summary: CampaignSummary) -> anyhow::Result<()> {
    println!("{} → {}", summary.id, summary.status);
    Ok(())
}

async fn cmd_campaign_show(db: &Db, owner: OwnerId, id: CampaignId) -> anyhow::Result<()> {
    let campaign = db.get_campaign(owner, id).await?;

    println!("ID:         {}", campaign.id);
    println!("Name:       {}", campaign.name);
    println!("Status:     {}", campaign.status);
    println!(
        "Sender:     {}",
        campaign
            .from_account_id
            .map(|a| a.to_string())
            .unwrap_or("-".to_string())
    );
    println!(
        "Template:   {}",
        campaign
            .template
            .as_ref()
            .map(|t| t.subject.as_str())
            .unwrap_or("-")
    );
    println!("Created:    {}", campaign.created_at);
    println!("Updated:    {}", campaign.updated_at);

    let contacts = db.list_campaign_contacts(id).await?;
    println!("---");
    println!(
        "{:<36}  {:<12}  {:<8}  NEXT SEND",
        "CONTACT", "STATUS", "PROGRESS"
    );
    for contact in &contacts {
        let sent = contact.current_email_number.saturating_sub(1);
        println!(
            "{:<36}  {:<12}  {:<8}  {}",
            contact.contact_id,
            contact.status,
            format!("{sent}/{}", contact.total_emails),
            contact
                .next_email_send_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or("-".to_string())
        );
    }
    println!("\n{} contact(s)", contacts.len());

    let events = db.list_events(id, 0).await?;
    if !events.is_empty() {
        println!("---");
        for event in events.iter().rev().take(10).rev() {
            println!(
                "{:>6}  {}  {:<18}  {}",
                event.seq,
                event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                event.kind.name(),
                event
                    .contact_id
                    .map(|c| c.to_string())
                    .unwrap_or_default()
            );
        }
    }

    Ok(())
}

async fn cmd_jobs(db: &Db, config: &Config, action: JobsAction) -> anyhow::Result<()> {
    match action {
        JobsAction::List {
            queue,
            status,
            campaign,
            limit,
        } => {
            let jobs = db
                .list_jobs(&JobFilter {
                    queue,
                    status,
                    campaign_id: campaign,
                    limit,
                })
                .await?;

            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }

            println!(
                "{:<8}  {:<18}  {:<10}  {:<5}  {:<16}  KEY",
                "ID", "QUEUE", "STATUS", "TRIES", "RUN AT"
            );
            println!("{}", "-".repeat(100));
            for job in &jobs {
                let short_id = &job.id.to_string()[..8];
                println!(
                    "{:<8}  {:<18}  {:<10}  {:<5}  {:<16}  {}",
                    short_id,
                    job.queue,
                    job.status,
                    format!("{}/{}", job.attempts, job.max_attempts),
                    job.run_at.format("%Y-%m-%d %H:%M"),
                    job.idempotency_key.as_deref().unwrap_or("-")
                );
            }
            println!("\n{} job(s)", jobs.len());
            Ok(())
        }
        JobsAction::Show { id } => {
            let job = db.get_job(id).await?;
            println!("ID:         {}", job.id);
            println!("Queue:      {}", job.queue);
            println!("Status:     {}", job.status);
            println!("Key:        {}", job.idempotency_key.as_deref().unwrap_or("-"));
            println!("Payload:    {}", serde_json::to_string_pretty(&job.payload)?);
            println!("Run At:     {}", job.run_at);
            println!("Attempts:   {}/{}", job.attempts, job.max_attempts);
            if let Some(ref err) = job.last_error {
                println!("Last Error: {err}");
            }
            if let Some(locked) = job.locked_at {
                println!("Locked At:  {locked}");
            }
            println!("Created:    {}", job.created_at);
            println!("Updated:    {}", job.updated_at);
            Ok(())
        }
        JobsAction::Reclaim { timeout_secs } => {
            let timeout = timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(config.stale_job_timeout);
            let reclaimed = db.reclaim_stale(timeout).await?;
            println!(
                "Requeued {} job(s); {} exhausted, {} contact(s) marked failed.",
                reclaimed.requeued,
                reclaimed.exhausted.len(),
                reclaimed.contacts_failed
            );
            for job in &reclaimed.exhausted {
                println!(
                    "  {} {}",
                    job.id,
                    job.idempotency_key.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
    }
}
