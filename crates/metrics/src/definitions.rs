//! Metric name and label definitions.
//!
//! Every metric courier records is named here so the set of exported series
//! is documented in one place.

/// Session table and dispatcher loop metrics
pub mod dispatch {
    /// Envelopes accepted by `submit`
    pub const ENVELOPES_SUBMITTED_TOTAL: &str = "courier_dispatch_envelopes_submitted_total";
    /// Envelopes rejected by `submit` (shutdown, missing session id)
    pub const ENVELOPES_REJECTED_TOTAL: &str = "courier_dispatch_envelopes_rejected_total";
    /// Envelopes admitted into the worker pool
    pub const ENVELOPES_ADMITTED_TOTAL: &str = "courier_dispatch_envelopes_admitted_total";
    /// Admissions rolled back because the pool was saturated or closed
    pub const ADMISSION_ROLLBACKS_TOTAL: &str = "courier_dispatch_admission_rollbacks_total";
    /// Queued envelopes discarded by cancellation
    pub const ENVELOPES_CANCELLED_TOTAL: &str = "courier_dispatch_envelopes_cancelled_total";
    /// Live session slots
    pub const SESSIONS_ACTIVE: &str = "courier_dispatch_sessions_active";
    /// Pipeline runs currently executing
    pub const RUNS_IN_FLIGHT: &str = "courier_dispatch_runs_in_flight";
    /// Time from admission to run completion
    pub const RUN_DURATION_SECONDS: &str = "courier_dispatch_run_duration_seconds";
}

/// Message pipeline metrics
pub mod pipeline {
    /// Envelopes dropped before a reply was produced (compose veto, hook stop)
    pub const ENVELOPES_DROPPED_TOTAL: &str = "courier_pipeline_envelopes_dropped_total";
    /// Runs that produced no reply
    pub const NO_REPLY_TOTAL: &str = "courier_pipeline_no_reply_total";
    /// Generator failures downgraded to error replies
    pub const GENERATOR_ERRORS_TOTAL: &str = "courier_pipeline_generator_errors_total";
    /// Runs abandoned because their session was cancelled
    pub const RUNS_CANCELLED_TOTAL: &str = "courier_pipeline_runs_cancelled_total";
    /// Stage duration in seconds
    pub const STAGE_DURATION_SECONDS: &str = "courier_pipeline_stage_duration_seconds";
}

/// Outbound delivery metrics
pub mod channels {
    /// Registered transports
    pub const ACTIVE: &str = "courier_channels_active";
    /// Reply segments sent successfully
    pub const SEGMENTS_SENT_TOTAL: &str = "courier_channel_segments_sent_total";
    /// Send attempts that will be retried
    pub const SEND_RETRIES_TOTAL: &str = "courier_channel_send_retries_total";
    /// Segments dropped after exhausting retries
    pub const SEND_FAILURES_TOTAL: &str = "courier_channel_send_failures_total";
}

/// Common label keys
pub mod labels {
    pub const CHANNEL: &str = "channel";
    pub const KIND: &str = "kind";
    pub const STAGE: &str = "stage";
    pub const REASON: &str = "reason";
}

/// Histogram bucket boundaries
pub mod buckets {
    use once_cell::sync::Lazy;

    /// Stage and run durations (in seconds).
    /// Covers 1ms to 2 minutes since generation stages call out to LLMs.
    pub static RUN_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
        ]
    });
}
