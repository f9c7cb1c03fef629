//! Types for the job orchestrator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dedup::DedupError;
use crate::job::{JobError, JobStatus};

/// Errors that can occur during orchestration.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Job store error, including rejected transitions.
    #[error("job store error: {0}")]
    JobStore(#[from] JobError),

    /// Deduplication index error.
    #[error("dedup index error: {0}")]
    Dedup(#[from] DedupError),
}

impl OrchestratorError {
    /// Returns true if the error is a rejected state transition.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(
            self,
            OrchestratorError::JobStore(JobError::InvalidTransition { .. })
        )
    }
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    /// The job answering for the content.
    pub job_id: String,
    /// True if no new work was created.
    pub is_duplicate: bool,
    /// Status of that job at the time of the call.
    pub status: JobStatus,
    /// Times the content has been seen, including this submission.
    pub usage_count: u64,
}

/// Read-only snapshot of the orchestrator's load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Whether the worker pool is running.
    pub running: bool,
    /// Size of the worker pool.
    pub workers: usize,
    /// Job ids waiting in the ready queue.
    pub queue_depth: usize,
    /// Attempts currently executing on this instance.
    pub in_flight: usize,
    /// Persisted job counts for every status.
    pub counts: BTreeMap<JobStatus, u64>,
}

impl QueueStatus {
    /// Number of jobs in `status`.
    pub fn count(&self, status: JobStatus) -> u64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

/// Why an in-flight attempt was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelReason {
    /// `cancel` was called for the job.
    User,
    /// The orchestrator is stopping and the grace period ran out.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_status_count() {
        let mut status = QueueStatus::default();
        status.counts.insert(JobStatus::Queued, 4);
        assert_eq!(status.count(JobStatus::Queued), 4);
        assert_eq!(status.count(JobStatus::Done), 0);
    }

    #[test]
    fn test_queue_status_serialization() {
        let mut status = QueueStatus {
            running: true,
            workers: 2,
            ..Default::default()
        };
        status.counts.insert(JobStatus::Retrying, 1);

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"retrying\":1"));
    }

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::JobNotFound("job-456".to_string());
        assert_eq!(err.to_string(), "job not found: job-456");
        assert!(!err.is_invalid_transition());

        let err = OrchestratorError::from(JobError::InvalidTransition {
            job_id: "job-1".to_string(),
            from: JobStatus::Done,
            to: JobStatus::Cancelled,
            reason: "job is already terminal".to_string(),
        });
        assert!(err.is_invalid_transition());
    }
}
