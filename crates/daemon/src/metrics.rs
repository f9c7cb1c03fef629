//! Prometheus metrics for observability.
//!
//! The daemon owns the registry. Besides the core collectors it tracks the
//! upload scanner and, when configured, writes the text exposition to a file
//! for the node-exporter textfile collector.

use std::path::Path;

use once_cell::sync::Lazy;
use prometheus::{self, Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use upflow_core::{JobOrchestrator, JobStatus};

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// Ingest Metrics
// =============================================================================

/// Files picked up from the upload directory, by result.
pub static UPLOADS_SCANNED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("upflow_uploads_scanned_total", "Upload files processed by the scanner"),
        &["result"],
    )
    .unwrap()
});

// =============================================================================
// Job Metrics (collected dynamically)
// =============================================================================

/// Jobs by current status.
pub static JOBS_BY_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("upflow_jobs_by_status", "Current job count by status"),
        &["status"],
    )
    .unwrap()
});

/// Orchestrator running state (1 = running, 0 = stopped).
pub static ORCHESTRATOR_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "upflow_orchestrator_running",
        "Whether the orchestrator is running (1) or stopped (0)",
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(UPLOADS_SCANNED.clone()))
        .unwrap();
    registry
        .register(Box::new(JOBS_BY_STATUS.clone()))
        .unwrap();
    registry
        .register(Box::new(ORCHESTRATOR_RUNNING.clone()))
        .unwrap();

    // Core metrics (submissions, attempts, queue)
    for metric in upflow_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Update gauges from the orchestrator before encoding.
pub fn collect_dynamic_metrics(orchestrator: &JobOrchestrator) {
    ORCHESTRATOR_RUNNING.set(if orchestrator.is_running() { 1 } else { 0 });

    match orchestrator.queue_status() {
        Ok(status) => {
            for job_status in JobStatus::ALL {
                JOBS_BY_STATUS
                    .with_label_values(&[job_status.as_str()])
                    .set(status.count(job_status) as i64);
            }
        }
        Err(e) => tracing::warn!("Failed to collect job counts: {}", e),
    }
}

/// Write the exposition to `path`, replacing it atomically.
pub async fn write_textfile(path: &Path) -> std::io::Result<()> {
    let tmp = path.with_extension("prom.tmp");
    tokio::fs::write(&tmp, encode_metrics()).await?;
    tokio::fs::rename(&tmp, path).await
}
