//! Deduplication index trait.

use thiserror::Error;

use super::DedupRecord;
use crate::fingerprint::Fingerprint;

/// Error type for deduplication index operations.
#[derive(Debug, Error)]
pub enum DedupError {
    /// No record for this fingerprint.
    #[error("no dedup record for fingerprint {0}")]
    NotFound(String),

    /// A record already exists for this fingerprint.
    #[error("dedup record already exists for fingerprint {0}")]
    AlreadyExists(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(String),
}

/// Maps content fingerprints to their processing record.
///
/// Callers serialize access per fingerprint; the index itself only
/// guarantees that each method is atomic.
pub trait DedupIndex: Send + Sync {
    /// Look up the record for a fingerprint.
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<DedupRecord>, DedupError>;

    /// Create the record for content seen for the first time.
    fn insert(
        &self,
        fingerprint: &Fingerprint,
        job_id: &str,
        original_name: &str,
    ) -> Result<DedupRecord, DedupError>;

    /// Repoint the record at a freshly created job and count the use.
    fn point_to(&self, fingerprint: &Fingerprint, job_id: &str) -> Result<DedupRecord, DedupError>;

    /// Count a duplicate submission answered by the current job.
    fn record_reuse(&self, fingerprint: &Fingerprint) -> Result<DedupRecord, DedupError>;
}
