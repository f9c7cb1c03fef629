//! Deduplication record types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::job::Job;

/// What the index remembers about one piece of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupRecord {
    /// Content hash (primary key).
    pub fingerprint: Fingerprint,
    /// The job that first processed this content.
    pub original_job_id: String,
    /// The job currently answering for this content. Differs from
    /// `original_job_id` once a failed job has been replaced or a
    /// reprocess was forced.
    pub job_id: String,
    /// File name of the first upload.
    pub original_name: String,
    /// Number of times this content has been seen, including the first.
    pub usage_count: u64,
    pub first_seen_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl DedupRecord {
    /// Confidence that an upload with this record is a true repeat.
    pub fn confidence(&self) -> DuplicateConfidence {
        DuplicateConfidence::from_usage(Some(self.usage_count))
    }
}

/// Coarse confidence label derived from how often content has been seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateConfidence {
    /// Never seen before.
    New,
    Low,
    Medium,
    High,
}

impl DuplicateConfidence {
    /// Map a usage count (`None` for unknown content) to a label.
    pub fn from_usage(usage_count: Option<u64>) -> Self {
        match usage_count {
            None => DuplicateConfidence::New,
            Some(n) if n > 3 => DuplicateConfidence::High,
            Some(n) if n > 1 => DuplicateConfidence::Medium,
            Some(_) => DuplicateConfidence::Low,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateConfidence::New => "new",
            DuplicateConfidence::Low => "low",
            DuplicateConfidence::Medium => "medium",
            DuplicateConfidence::High => "high",
        }
    }
}

impl fmt::Display for DuplicateConfidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about a fingerprint, for operators deciding whether to
/// reprocess.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateReport {
    pub fingerprint: Fingerprint,
    /// `None` if the content has never been admitted.
    pub record: Option<DedupRecord>,
    /// Most recent jobs for this content, newest first.
    pub recent_jobs: Vec<Job>,
    pub confidence: DuplicateConfidence,
}

impl DuplicateReport {
    /// Returns true if the content has been admitted before.
    pub fn is_duplicate(&self) -> bool {
        self.record.is_some()
    }
}
