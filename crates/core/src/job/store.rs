//! Job storage trait and types.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::fingerprint::Fingerprint;
use crate::job::{Job, JobMetadata, JobStatus};

/// Error type for job store operations.
#[derive(Debug, Error)]
pub enum JobError {
    /// Job not found.
    #[error("job not found: {0}")]
    NotFound(String),

    /// The requested status change is not permitted.
    ///
    /// `from` is the status the job actually had when the change was
    /// attempted.
    #[error("invalid transition for job {job_id}: {from} -> {to} ({reason})")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
        reason: String,
    },

    /// Database error.
    #[error("database error: {0}")]
    Database(String),
}

/// Request to create a new job.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    /// Content hash of the upload.
    pub fingerprint: Fingerprint,
    /// Upload description.
    pub metadata: JobMetadata,
    /// Attempt budget for this job.
    pub max_attempts: u32,
}

/// A compare-and-transition request.
///
/// Applied only if the job's current status equals `from` and, when set, its
/// attempt count equals `attempt`. Timestamp fields are derived by the store:
/// entering `Running` stamps `started_at` and bumps `attempt_count`, entering
/// a terminal status stamps `finished_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: JobStatus,
    pub to: JobStatus,
    /// Guard against reports from an attempt that has since been superseded.
    pub attempt: Option<u32>,
    /// New `last_error`; `None` keeps the previous one.
    pub last_error: Option<String>,
    /// Scheduled re-entry time when moving to `Retrying`.
    pub retry_at: Option<DateTime<Utc>>,
}

impl Transition {
    /// Create a transition between two statuses.
    pub fn new(from: JobStatus, to: JobStatus) -> Self {
        Self {
            from,
            to,
            attempt: None,
            last_error: None,
            retry_at: None,
        }
    }

    /// Require the job to still be on this attempt.
    pub fn for_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Record a failure cause.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    /// Schedule re-entry into the queue.
    pub fn with_retry_at(mut self, retry_at: DateTime<Utc>) -> Self {
        self.retry_at = Some(retry_at);
        self
    }
}

/// Filter for querying jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Filter by status.
    pub status: Option<JobStatus>,
    /// Filter by content fingerprint.
    pub fingerprint: Option<Fingerprint>,
    /// Oldest first instead of newest first.
    pub oldest_first: bool,
    /// Maximum number of results.
    pub limit: i64,
    /// Offset for pagination.
    pub offset: i64,
}

impl JobFilter {
    /// Create a new filter with defaults.
    pub fn new() -> Self {
        Self {
            limit: 100,
            ..Default::default()
        }
    }

    /// Filter by status.
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filter by fingerprint.
    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }

    /// Return the oldest submissions first.
    pub fn oldest_first(mut self) -> Self {
        self.oldest_first = true;
        self
    }

    /// Set limit.
    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Set offset.
    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Trait for job storage backends.
///
/// The store is the single source of truth for job state. Only the
/// orchestrator calls the mutating methods.
pub trait JobStore: Send + Sync {
    /// Create a new job in `Queued`.
    fn create(&self, request: CreateJobRequest) -> Result<Job, JobError>;

    /// Get a job by ID.
    fn get(&self, id: &str) -> Result<Option<Job>, JobError>;

    /// List jobs matching the filter.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError>;

    /// Number of jobs in each status. Statuses with no jobs are omitted.
    fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>, JobError>;

    /// Atomically apply `transition` if the job is still in `transition.from`.
    fn compare_and_transition(&self, id: &str, transition: Transition) -> Result<Job, JobError>;

    /// Refresh the liveness timestamp of a running attempt.
    ///
    /// Returns false if the job is no longer running that attempt.
    fn record_heartbeat(&self, id: &str, attempt: u32) -> Result<bool, JobError>;

    /// Most recently submitted jobs.
    fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobError> {
        self.list(&JobFilter::new().with_limit(limit as i64))
    }

    /// Most recent jobs for one fingerprint.
    fn list_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
        limit: usize,
    ) -> Result<Vec<Job>, JobError> {
        self.list(
            &JobFilter::new()
                .with_fingerprint(fingerprint.clone())
                .with_limit(limit as i64),
        )
    }
}
