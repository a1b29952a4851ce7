//! # outreach
//!
//! Postgres-backed orchestration core for multi-step email outreach
//! campaigns.
//!
//! Provides the campaign lifecycle state machine, a durable job queue with
//! skip-locked claims and idempotency keys, per-contact sequence progress,
//! launch validation, a worker that sends through a pluggable [`mailer`],
//! and OpenTelemetry observability.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod mailer;
pub mod model;
pub mod telemetry;
