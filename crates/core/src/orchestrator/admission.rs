//! Admission: turning uploads into jobs, deduplicated by fingerprint.

use std::sync::Arc;

use tracing::info;

use crate::audit::AuditEvent;
use crate::fingerprint::Fingerprint;
use crate::job::{CreateJobRequest, JobMetadata, JobStatus};
use crate::metrics;

use super::runner::Shared;
use super::types::{OrchestratorError, SubmitOutcome};

impl Shared {
    /// Per-fingerprint admission lock. Idle locks are pruned on each call.
    fn admission_lock(&self, fingerprint: &Fingerprint) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.admission.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(fingerprint.to_string()).or_default())
    }

    /// Resolve a submission against the dedup index.
    ///
    /// Submissions of the same fingerprint are serialized; different
    /// fingerprints admit concurrently.
    pub(super) async fn admit(
        self: &Arc<Self>,
        fingerprint: Fingerprint,
        mut metadata: JobMetadata,
        forced: bool,
    ) -> Result<SubmitOutcome, OrchestratorError> {
        let lock = self.admission_lock(&fingerprint);
        let _guard = lock.lock().await;

        let record = self.dedup.get(&fingerprint)?;

        if let Some(ref record) = record {
            if let Some(existing) = self.store.get(&record.job_id)? {
                let reuse = existing.status.is_active()
                    || (existing.status == JobStatus::Done && !forced);

                if reuse {
                    let usage_count = if existing.status == JobStatus::Done {
                        self.dedup.record_reuse(&fingerprint)?.usage_count
                    } else {
                        record.usage_count
                    };

                    info!(
                        "Duplicate upload {} resolved to job {} ({})",
                        fingerprint.short(),
                        existing.id,
                        existing.status
                    );
                    metrics::SUBMISSIONS.with_label_values(&["duplicate"]).inc();
                    self.emit(AuditEvent::DuplicateSubmission {
                        job_id: existing.id.clone(),
                        fingerprint: fingerprint.to_string(),
                        existing_status: existing.status.to_string(),
                        usage_count,
                    });

                    return Ok(SubmitOutcome {
                        job_id: existing.id,
                        is_duplicate: true,
                        status: existing.status,
                        usage_count,
                    });
                }
            }
        }

        if metadata.dataset_type.is_none() {
            metadata.dataset_type = self.classifier.classify(&metadata);
        }

        let job = self.store.create(CreateJobRequest {
            fingerprint: fingerprint.clone(),
            metadata,
            max_attempts: self.policy.max_attempts,
        })?;

        let (record, result) = match record {
            None => (
                self.dedup
                    .insert(&fingerprint, &job.id, &job.metadata.original_filename)?,
                "created",
            ),
            Some(_) => (
                self.dedup.point_to(&fingerprint, &job.id)?,
                if forced { "forced" } else { "readmitted" },
            ),
        };

        info!(
            "Admitted job {} for {} ({}, {})",
            job.id,
            fingerprint.short(),
            job.metadata.original_filename,
            result
        );
        metrics::SUBMISSIONS.with_label_values(&[result]).inc();
        self.emit(AuditEvent::JobSubmitted {
            job_id: job.id.clone(),
            fingerprint: fingerprint.to_string(),
            original_filename: job.metadata.original_filename.clone(),
            dataset_type: job.metadata.dataset_type.clone(),
            forced,
        });

        self.queue.push(&job.id);

        Ok(SubmitOutcome {
            job_id: job.id,
            is_duplicate: false,
            status: job.status,
            usage_count: record.usage_count,
        })
    }
}
