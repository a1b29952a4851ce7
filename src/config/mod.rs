//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. Sensitive values wrapped in secrecy::SecretString to prevent
//! log leaks.

pub mod secrets;

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Fallback poll interval when no `jobs_ready` notification arrives.
    pub worker_poll_interval: Duration,
    /// Jobs a worker runs at once.
    pub worker_concurrency: usize,
    pub job_max_attempts: u32,
    /// Base delay for exponential retry backoff.
    pub retry_backoff: Duration,
    /// A `running` job whose claim is older than this is reclaimed.
    pub stale_job_timeout: Duration,
    /// How long a send job for a paused campaign waits before rechecking.
    pub pause_recheck: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            worker_poll_interval: Duration::from_millis(parsed_var("WORKER_POLL_INTERVAL_MS", 1000)?),
            worker_concurrency: parsed_var::<usize>("WORKER_CONCURRENCY", 4)?.max(1),
            job_max_attempts: parsed_var::<u32>("JOB_MAX_ATTEMPTS", 5)?.max(1),
            retry_backoff: Duration::from_secs(parsed_var("RETRY_BACKOFF_SECS", 30)?),
            stale_job_timeout: Duration::from_secs(parsed_var("STALE_JOB_TIMEOUT_SECS", 600)?),
            pause_recheck: Duration::from_secs(parsed_var("PAUSE_RECHECK_SECS", 300)?),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            Error::Config(format!("environment variable {name} has invalid value {raw:?}"))
        }),
        Err(_) => Ok(default),
    }
}
