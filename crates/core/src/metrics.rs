//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Admission (submissions, duplicates)
//! - Attempts (outcomes, durations, retries)
//! - Recovery (sweep reclaims)
//! - Queue (depth, in-flight attempts)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts};

// =============================================================================
// Admission Metrics
// =============================================================================

/// Submissions total by result.
pub static SUBMISSIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("upflow_submissions_total", "Total job submissions"),
        &["result"], // "created", "duplicate", "readmitted", "forced"
    )
    .unwrap()
});

// =============================================================================
// Attempt Metrics
// =============================================================================

/// Attempts total by outcome.
pub static ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("upflow_attempts_total", "Total pipeline attempts"),
        &["outcome"], // "success", "retryable", "fatal", "cancelled", "timed_out"
    )
    .unwrap()
});

/// Attempt duration in seconds.
pub static ATTEMPT_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "upflow_attempt_duration_seconds",
            "Duration of pipeline attempts",
        )
        .buckets(vec![
            1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0,
        ]),
        &["outcome"],
    )
    .unwrap()
});

/// Retries scheduled total.
pub static RETRIES_SCHEDULED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "upflow_retries_scheduled_total",
        "Total retries scheduled after a transient failure",
    )
    .unwrap()
});

/// Jobs reaching a terminal status, by status.
pub static JOBS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("upflow_jobs_finished_total", "Total jobs reaching a terminal status"),
        &["status"], // "done", "failed", "error", "cancelled"
    )
    .unwrap()
});

// =============================================================================
// Recovery Metrics
// =============================================================================

/// Orphaned attempts reclaimed by the sweep or at startup.
pub static ORPHANS_RECLAIMED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "upflow_orphans_reclaimed_total",
        "Total running attempts reclaimed as orphans",
    )
    .unwrap()
});

/// Transitions rejected by the store.
pub static INVALID_TRANSITIONS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "upflow_invalid_transitions_total",
        "Total state transitions rejected as invalid",
    )
    .unwrap()
});

// =============================================================================
// Queue Metrics
// =============================================================================

/// Job ids waiting in the ready queue.
pub static QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("upflow_queue_depth", "Jobs waiting in the ready queue").unwrap()
});

/// Attempts currently running on workers.
pub static IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("upflow_in_flight_attempts", "Attempts currently running").unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Admission
        Box::new(SUBMISSIONS.clone()),
        // Attempts
        Box::new(ATTEMPTS.clone()),
        Box::new(ATTEMPT_DURATION.clone()),
        Box::new(RETRIES_SCHEDULED.clone()),
        Box::new(JOBS_FINISHED.clone()),
        // Recovery
        Box::new(ORPHANS_RECLAIMED.clone()),
        Box::new(INVALID_TRANSITIONS.clone()),
        // Queue
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(IN_FLIGHT.clone()),
    ]
}
