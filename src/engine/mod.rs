//! Background execution: the job worker that sends campaign email and fires
//! scheduled launches.

pub mod worker;

pub use worker::{Worker, WorkerConfig, backoff};
