//! Core job data types.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fingerprint::Fingerprint;

/// Current status of a job.
///
/// State machine flow:
/// ```text
/// Queued -> Running -> Done
///   ^          |
///   |          +----> Retrying --(backoff)--> Queued
///   |          +----> Failed     (retry budget exhausted)
///   |          +----> Error      (non-retryable failure)
///   |          +----> Cancelled
///   +--------------> Cancelled
/// ```
///
/// `Done`, `Failed`, `Error` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the ready queue.
    Queued,
    /// An attempt is in flight on a worker.
    Running,
    /// Last attempt failed transiently; waiting for the backoff delay.
    Retrying,
    /// Pipeline finished successfully (terminal).
    Done,
    /// Retry budget exhausted (terminal).
    Failed,
    /// Non-retryable failure (terminal).
    Error,
    /// Cancelled on request (terminal).
    Cancelled,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Retrying,
        JobStatus::Done,
        JobStatus::Failed,
        JobStatus::Error,
        JobStatus::Cancelled,
    ];

    /// Returns true if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Failed | JobStatus::Error | JobStatus::Cancelled
        )
    }

    /// Returns true if the job still holds the fingerprint's admission slot.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns true if a cancel request can apply in this status.
    pub fn can_cancel(&self) -> bool {
        self.can_transition_to(JobStatus::Cancelled)
    }

    /// The transition table. Every store mutation is checked against it.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Done)
                | (Running, Retrying)
                | (Running, Failed)
                | (Running, Error)
                | (Running, Cancelled)
                | (Retrying, Queued)
                | (Retrying, Cancelled)
        )
    }

    /// Returns the status as a string (for storage and filtering).
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Retrying => "retrying",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored status string that names no known status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown job status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

/// Producer-supplied description of the uploaded file.
///
/// Opaque to the orchestrator apart from `dataset_type`, which the
/// classifier fills in at admission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct JobMetadata {
    /// Name of the file as uploaded.
    pub original_filename: String,

    /// Where the uploaded bytes can be read by the pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,

    /// Size of the upload in bytes.
    #[serde(default)]
    pub size_bytes: u64,

    /// Coarse dataset type assigned by the classifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_type: Option<String>,
}

impl JobMetadata {
    /// Create metadata for an uploaded file name.
    pub fn new(original_filename: impl Into<String>) -> Self {
        Self {
            original_filename: original_filename.into(),
            ..Default::default()
        }
    }

    /// Set the path the pipeline reads from.
    pub fn with_source_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    /// Set the upload size.
    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    /// Set the dataset type.
    pub fn with_dataset_type(mut self, dataset_type: impl Into<String>) -> Self {
        self.dataset_type = Some(dataset_type.into());
        self
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Unique identifier (UUID), assigned at admission.
    pub id: String,

    /// Content hash of the upload.
    pub fingerprint: Fingerprint,

    /// Current status.
    pub status: JobStatus,

    /// Upload description handed to the pipeline.
    pub metadata: JobMetadata,

    /// Number of pipeline invocations so far.
    pub attempt_count: u32,

    /// Attempt budget fixed at admission.
    pub max_attempts: u32,

    /// When the job was admitted.
    pub submitted_at: DateTime<Utc>,

    /// Start of the most recent attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Set once the job reaches a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Last liveness signal from the worker running the current attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,

    /// When a retrying job re-enters the queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,

    /// Human-readable cause of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Returns true if the job is in a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Attempts left before the job fails for good.
    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }

    /// Returns true if the budget allows another attempt after `attempt` failed.
    pub fn can_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        let terminal: Vec<_> = JobStatus::ALL.iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal,
            vec![
                &JobStatus::Done,
                &JobStatus::Failed,
                &JobStatus::Error,
                &JobStatus::Cancelled
            ]
        );
        assert!(JobStatus::Retrying.is_active());
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in JobStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for to in JobStatus::ALL {
                assert!(!from.can_transition_to(to), "{} -> {} allowed", from, to);
            }
        }
    }

    #[test]
    fn test_transition_table() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Retrying));
        assert!(JobStatus::Retrying.can_transition_to(JobStatus::Queued));

        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Done));
        assert!(!JobStatus::Retrying.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn test_can_cancel() {
        assert!(JobStatus::Queued.can_cancel());
        assert!(JobStatus::Running.can_cancel());
        assert!(JobStatus::Retrying.can_cancel());
        assert!(!JobStatus::Done.can_cancel());
        assert!(!JobStatus::Cancelled.can_cancel());
    }

    #[test]
    fn test_can_retry_after() {
        let now = Utc::now();
        let job = Job {
            id: "job-1".to_string(),
            fingerprint: Fingerprint::new_unchecked("abc"),
            status: JobStatus::Running,
            metadata: JobMetadata::new("readings.csv"),
            attempt_count: 2,
            max_attempts: 3,
            submitted_at: now,
            started_at: Some(now),
            finished_at: None,
            heartbeat_at: None,
            retry_at: None,
            last_error: None,
            updated_at: now,
        };

        assert!(job.can_retry_after(1));
        assert!(job.can_retry_after(2));
        assert!(!job.can_retry_after(3));
        assert_eq!(job.attempts_remaining(), 1);
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        let err = "pending".parse::<JobStatus>().unwrap_err();
        assert_eq!(err, ParseStatusError("pending".to_string()));
        assert_eq!(err.to_string(), "unknown job status: pending");
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&JobStatus::Retrying).unwrap();
        assert_eq!(json, "\"retrying\"");
    }

    #[test]
    fn test_metadata_skips_empty_fields() {
        let metadata = JobMetadata::new("readings.csv").with_size(42);
        let json = serde_json::to_string(&metadata).unwrap();
        assert!(!json.contains("source_path"));
        assert!(!json.contains("dataset_type"));

        let parsed: JobMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, metadata);
    }
}
