//! Database connection pool, migrations, and health check.
//!
//! Postgres is the single source of truth. Every operation in the submodules
//! is one conditional statement or a short transaction; no in-process locks
//! coordinate workers or API callers.

pub mod campaigns;
pub mod content;
pub mod events;
pub mod jobs;
pub mod progress;
pub mod validate;

use crate::error::Result;
use crate::model::job::DEFAULT_MAX_ATTEMPTS;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: PgPool,
    job_max_attempts: u32,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, 10).await
    }

    /// Connect with an explicit pool size. Workers want at least one
    /// connection per concurrent job plus one for the listener.
    pub async fn connect_with(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self {
            pool,
            job_max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    /// Attempts allowed for jobs this handle queues on its own (launch
    /// jobs, next sequence steps, scheduled launches).
    pub fn with_job_max_attempts(mut self, n: u32) -> Self {
        self.job_max_attempts = n.max(1);
        self
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }
}
