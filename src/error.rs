//! Error types for outreach.

use thiserror::Error;

use crate::model::JobId;
use crate::model::campaign::{CampaignOp, CampaignStatus, ValidationReason};

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("illegal transition: cannot {op} a {from} campaign")]
    IllegalTransition { op: CampaignOp, from: CampaignStatus },

    #[error("campaign is not ready: {}", reason_list(.0))]
    ValidationFailed(Vec<ValidationReason>),

    #[error("cannot delete a {status} campaign")]
    DeleteNotAllowed { status: CampaignStatus },

    #[error("campaign is {status}; contacts and content can no longer change")]
    Locked { status: CampaignStatus },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("job {0} is not running")]
    JobNotRunning(JobId),

    #[error("bad job payload: {0}")]
    Payload(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Machine-readable error code for callers that map errors to responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::IllegalTransition { .. } => "ILLEGAL_TRANSITION",
            Self::ValidationFailed(_) => "VALIDATION_FAILED",
            Self::DeleteNotAllowed { .. } => "DELETE_NOT_ALLOWED",
            Self::Locked { .. } => "CAMPAIGN_LOCKED",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::JobNotRunning(_) => "JOB_NOT_RUNNING",
            Self::Payload(_) => "BAD_PAYLOAD",
            Self::Config(_) => "CONFIG",
            Self::Database(_) | Self::Migration(_) | Self::Other(_) => "INTERNAL",
        }
    }
}

fn reason_list(reasons: &[ValidationReason]) -> String {
    reasons
        .iter()
        .map(|r| r.code())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;
