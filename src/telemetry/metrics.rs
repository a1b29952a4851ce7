//! Metric instrument factories for outreach.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"outreach"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for outreach instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("outreach")
}

/// Counter: jobs enqueued.
/// Labels: `queue`, `result` ("created" | "duplicate").
pub fn jobs_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("outreach.jobs.enqueued")
        .with_description("Number of enqueue attempts")
        .build()
}

/// Counter: queue-level operations.
/// Labels: `queue`, `operation`
/// ("claim" | "claim_empty" | "complete" | "retry" | "dead" | "defer" | "reclaim").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("outreach.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: campaign lifecycle operations.
/// Labels: `op`, `result` ("ok" | "illegal" | "invalid" | "not_found").
pub fn campaign_transitions() -> Counter<u64> {
    meter()
        .u64_counter("outreach.campaign.transitions")
        .with_description("Number of campaign lifecycle operations")
        .build()
}

/// Counter: email send attempts.
/// Labels: `result` ("sent" | "retryable" | "permanent" | "skipped").
pub fn emails() -> Counter<u64> {
    meter()
        .u64_counter("outreach.emails")
        .with_description("Email send attempts by result")
        .build()
}

/// Histogram: job handling duration in milliseconds.
/// Labels: `queue`.
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("outreach.job.duration_ms")
        .with_description("Job handling duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: jobs whose payload could not be decoded and were parked.
/// Labels: `queue`.
pub fn jobs_undecodable() -> Counter<u64> {
    meter()
        .u64_counter("outreach.jobs.undecodable")
        .with_description("Jobs parked because their payload did not decode")
        .build()
}
