//! Job orchestrator implementation.
//!
//! Owns the worker pool, the completion loop that applies attempt outcomes,
//! the staleness sweep and the retry timers. Every status change goes
//! through [`Shared::transition`], which uses the store's atomic
//! compare-and-transition.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, AuditHandle};
use crate::classifier::Classifier;
use crate::dedup::{DedupIndex, DuplicateConfidence, DuplicateReport};
use crate::fingerprint::Fingerprint;
use crate::job::{Job, JobError, JobMetadata, JobStatus, JobStore, Transition};
use crate::metrics;
use crate::runner::PipelineRunner;

use super::config::OrchestratorConfig;
use super::queue::ReadyQueue;
use super::retry::RetryPolicy;
use super::types::{CancelReason, OrchestratorError, QueueStatus, SubmitOutcome};
use super::worker::{completion_loop, worker_loop};

/// How often `cancel` re-reads a job whose status moved underneath it.
const CANCEL_ATTEMPTS: usize = 3;

/// An attempt currently executing on this instance.
pub(super) struct InFlight {
    pub attempt: u32,
    pub token: CancellationToken,
    pub reason: Option<CancelReason>,
}

/// State shared by the orchestrator handle and its background tasks.
pub(super) struct Shared {
    pub config: OrchestratorConfig,
    pub policy: RetryPolicy,
    pub store: Arc<dyn JobStore>,
    pub dedup: Arc<dyn DedupIndex>,
    pub runner: Arc<dyn PipelineRunner>,
    pub classifier: Arc<dyn Classifier>,
    pub audit: Option<AuditHandle>,
    pub queue: ReadyQueue,
    /// Lock order: `in_flight` before any store call.
    pub in_flight: Mutex<HashMap<String, InFlight>>,
    pub admission: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Stops the sweep and pending retry timers.
    pub shutdown: CancellationToken,
}

impl Shared {
    pub(super) fn in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(super) fn emit(&self, event: AuditEvent) {
        if let Some(ref audit) = self.audit {
            audit.try_emit(event);
        }
    }

    /// Apply a transition through the store, logging and auditing the result.
    pub(super) fn transition(&self, job_id: &str, transition: Transition) -> Result<Job, JobError> {
        let from = transition.from;
        let reason = transition.last_error.clone();

        match self.store.compare_and_transition(job_id, transition) {
            Ok(job) => {
                info!(
                    "Job {}: {} (attempt {}/{})",
                    job.id, job.status, job.attempt_count, job.max_attempts
                );
                self.emit(AuditEvent::JobStateChanged {
                    job_id: job.id.clone(),
                    from_state: from.to_string(),
                    to_state: job.status.to_string(),
                    attempt: job.attempt_count,
                    reason,
                });
                if job.status.is_terminal() {
                    metrics::JOBS_FINISHED
                        .with_label_values(&[job.status.as_str()])
                        .inc();
                }
                Ok(job)
            }
            Err(e) => {
                if let JobError::InvalidTransition {
                    job_id,
                    from,
                    to,
                    reason,
                } = &e
                {
                    warn!("Rejected transition for job {}: {} -> {} ({})", job_id, from, to, reason);
                    metrics::INVALID_TRANSITIONS.inc();
                    self.emit(AuditEvent::InvalidTransition {
                        job_id: job_id.clone(),
                        from_state: from.to_string(),
                        to_state: to.to_string(),
                        reason: reason.clone(),
                    });
                } else {
                    error!("Failed to transition job {}: {}", job_id, e);
                }
                Err(e)
            }
        }
    }

    /// Treat `attempt` of a running job as a transient failure: schedule a
    /// retry if the budget allows, otherwise fail the job.
    pub(super) fn fail_attempt(
        self: &Arc<Self>,
        job_id: &str,
        attempt: u32,
        reason: &str,
    ) -> Result<Job, JobError> {
        let job = self
            .store
            .get(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        if !job.can_retry_after(attempt) {
            return self.transition(
                job_id,
                Transition::new(JobStatus::Running, JobStatus::Failed)
                    .for_attempt(attempt)
                    .with_error(reason),
            );
        }

        let delay = self.policy.backoff(attempt);
        let retry_at =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        let job = self.transition(
            job_id,
            Transition::new(JobStatus::Running, JobStatus::Retrying)
                .for_attempt(attempt)
                .with_error(reason)
                .with_retry_at(retry_at),
        )?;

        info!("Job {}: retry {} scheduled in {:?}", job_id, attempt + 1, delay);
        metrics::RETRIES_SCHEDULED.inc();
        self.schedule_retry(job_id.to_string(), delay);
        Ok(job)
    }

    /// Re-queue a retrying job once `delay` has elapsed. Does not occupy a worker.
    pub(super) fn schedule_retry(self: &Arc<Self>, job_id: String, delay: Duration) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.shutdown.cancelled() => {
                    debug!("Retry timer for job {} dropped on shutdown", job_id);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            shared.requeue(&job_id);
        });
    }

    fn requeue(&self, job_id: &str) {
        match self.store.get(job_id) {
            Ok(Some(job)) if job.status == JobStatus::Retrying => {}
            Ok(Some(job)) => {
                debug!("Job {} is {} at retry time, not re-queueing", job_id, job.status);
                return;
            }
            Ok(None) => {
                warn!("Job {} vanished before its retry", job_id);
                return;
            }
            Err(e) => {
                error!("Failed to load job {} for retry: {}", job_id, e);
                return;
            }
        }

        if self
            .transition(job_id, Transition::new(JobStatus::Retrying, JobStatus::Queued))
            .is_ok()
        {
            self.queue.push(job_id);
        }
    }

    fn cancel(&self, job_id: &str) -> Result<Job, OrchestratorError> {
        let mut last_err = None;

        for _ in 0..CANCEL_ATTEMPTS {
            let job = self
                .store
                .get(job_id)?
                .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))?;
            let previous = job.status;

            let result = match job.status {
                JobStatus::Queued => {
                    self.queue.remove(job_id);
                    self.transition(job_id, Transition::new(JobStatus::Queued, JobStatus::Cancelled))
                }
                JobStatus::Running => {
                    let mut in_flight = self.in_flight();
                    let signalled = match in_flight.get_mut(job_id) {
                        Some(entry) if entry.attempt == job.attempt_count => {
                            entry.reason = Some(CancelReason::User);
                            entry.token.cancel();
                            true
                        }
                        _ => false,
                    };

                    if signalled {
                        drop(in_flight);
                        info!(
                            "Job {}: cancellation signalled to attempt {}",
                            job_id, job.attempt_count
                        );
                        self.emit(AuditEvent::JobCancelRequested {
                            job_id: job_id.to_string(),
                            previous_state: previous.to_string(),
                        });
                        return Ok(job);
                    }

                    // Not running here; nothing will report back.
                    self.transition(
                        job_id,
                        Transition::new(JobStatus::Running, JobStatus::Cancelled)
                            .for_attempt(job.attempt_count)
                            .with_error("cancelled on request"),
                    )
                }
                status => self.transition(job_id, Transition::new(status, JobStatus::Cancelled)),
            };

            match result {
                Ok(job) => {
                    self.emit(AuditEvent::JobCancelRequested {
                        job_id: job_id.to_string(),
                        previous_state: previous.to_string(),
                    });
                    return Ok(job);
                }
                Err(JobError::InvalidTransition { from, .. }) if !from.is_terminal() => {
                    // Status moved between the read and the update; look again.
                    last_err = Some(JobError::InvalidTransition {
                        job_id: job_id.to_string(),
                        from,
                        to: JobStatus::Cancelled,
                        reason: "status changed during cancel".to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(last_err
            .unwrap_or_else(|| JobError::NotFound(job_id.to_string()))
            .into())
    }

    /// Cancel every in-flight attempt, leaving their jobs running.
    fn interrupt_in_flight(&self) -> usize {
        let mut in_flight = self.in_flight();
        for entry in in_flight.values_mut() {
            entry.reason = Some(CancelReason::Shutdown);
            entry.token.cancel();
        }
        in_flight.len()
    }
}

#[derive(Default)]
struct Tasks {
    workers: Vec<JoinHandle<()>>,
    completion: Option<JoinHandle<()>>,
    sweep: Option<JoinHandle<()>>,
}

/// The job orchestrator: admits uploads, runs them on a bounded worker pool
/// and drives each job through its state machine.
pub struct JobOrchestrator {
    shared: Arc<Shared>,
    running: AtomicBool,
    tasks: tokio::sync::Mutex<Tasks>,
}

impl JobOrchestrator {
    /// Create a new orchestrator. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn JobStore>,
        dedup: Arc<dyn DedupIndex>,
        runner: Arc<dyn PipelineRunner>,
        classifier: Arc<dyn Classifier>,
        audit: Option<AuditHandle>,
    ) -> Self {
        let policy = config.retry_policy();

        Self {
            shared: Arc::new(Shared {
                config,
                policy,
                store,
                dedup,
                runner,
                classifier,
                audit,
                queue: ReadyQueue::new(),
                in_flight: Mutex::new(HashMap::new()),
                admission: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
            running: AtomicBool::new(false),
            tasks: tokio::sync::Mutex::new(Tasks::default()),
        }
    }

    /// Admit an upload. Identical content resolves to the existing job
    /// while that job is active or done.
    pub async fn submit(
        &self,
        fingerprint: Fingerprint,
        metadata: JobMetadata,
    ) -> Result<SubmitOutcome, OrchestratorError> {
        self.shared.admit(fingerprint, metadata, false).await
    }

    /// Admit an upload, creating a fresh job even if the content was already
    /// processed successfully. An active job for the content is still
    /// returned as a duplicate.
    pub async fn resubmit(
        &self,
        fingerprint: Fingerprint,
        metadata: JobMetadata,
    ) -> Result<SubmitOutcome, OrchestratorError> {
        self.shared.admit(fingerprint, metadata, true).await
    }

    /// Cancel a job.
    ///
    /// Queued and retrying jobs are cancelled immediately. For a running job
    /// the in-flight attempt is signalled and the job becomes `cancelled`
    /// once the attempt returns; the returned snapshot is still `running`.
    pub async fn cancel(&self, job_id: &str) -> Result<Job, OrchestratorError> {
        self.shared.cancel(job_id)
    }

    /// Current record of a job.
    pub fn get_status(&self, job_id: &str) -> Result<Job, OrchestratorError> {
        self.shared
            .store
            .get(job_id)?
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))
    }

    /// Most recently submitted jobs.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<Job>, OrchestratorError> {
        Ok(self.shared.store.list_recent(limit)?)
    }

    /// Counts per status plus live queue figures.
    pub fn queue_status(&self) -> Result<QueueStatus, OrchestratorError> {
        let stored = self.shared.store.count_by_status()?;
        let counts: BTreeMap<JobStatus, u64> = JobStatus::ALL
            .iter()
            .map(|status| (*status, stored.get(status).copied().unwrap_or(0)))
            .collect();

        Ok(QueueStatus {
            running: self.is_running(),
            workers: self.shared.config.workers,
            queue_depth: self.shared.queue.len(),
            in_flight: self.shared.in_flight().len(),
            counts,
        })
    }

    /// Everything known about a fingerprint.
    pub fn duplicate_report(
        &self,
        fingerprint: &Fingerprint,
        limit: usize,
    ) -> Result<DuplicateReport, OrchestratorError> {
        let record = self.shared.dedup.get(fingerprint)?;
        let recent_jobs = if record.is_some() {
            self.shared.store.list_by_fingerprint(fingerprint, limit)?
        } else {
            Vec::new()
        };

        Ok(DuplicateReport {
            fingerprint: fingerprint.clone(),
            confidence: DuplicateConfidence::from_usage(record.as_ref().map(|r| r.usage_count)),
            record,
            recent_jobs,
        })
    }

    /// Run one staleness sweep as if the clock read `now`.
    ///
    /// Returns the number of attempts reclaimed. The background sweep calls
    /// this with the current time.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        self.shared.sweep_at(now)
    }

    /// Returns true between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Recover persisted work and spawn the background tasks.
    pub async fn start(&self) {
        if self.shared.queue.is_closed() {
            warn!("Orchestrator was stopped and cannot be restarted");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Orchestrator already running");
            return;
        }

        let workers = self.shared.config.workers;
        info!("Starting job orchestrator with {} workers", workers);

        if let Err(e) = self.shared.recover() {
            error!("Failed to recover persisted jobs: {}", e);
        }

        let (report_tx, report_rx) = mpsc::channel(workers.max(1) * 4);
        let mut tasks = self.tasks.lock().await;

        for worker_id in 0..workers {
            tasks.workers.push(tokio::spawn(worker_loop(
                Arc::clone(&self.shared),
                worker_id,
                report_tx.clone(),
            )));
        }
        // Workers own the only senders, so the completion loop ends after
        // the last worker exits and its reports are drained.
        drop(report_tx);

        tasks.completion = Some(tokio::spawn(completion_loop(
            Arc::clone(&self.shared),
            report_rx,
        )));
        tasks.sweep = Some(tokio::spawn(Arc::clone(&self.shared).sweep_loop()));

        info!("Job orchestrator started");
    }

    /// Stop dispatching, wait for in-flight attempts, then stop background tasks.
    ///
    /// Attempts still running after the grace period are cancelled and their
    /// jobs stay `running`; the next start reclaims them. Queued and retrying
    /// jobs stay persisted.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Orchestrator not running");
            return;
        }

        info!("Stopping job orchestrator");
        self.shared.queue.close();

        let grace = self.shared.config.shutdown_grace();
        let mut tasks = self.tasks.lock().await;

        let workers = futures::future::join_all(std::mem::take(&mut tasks.workers));
        tokio::pin!(workers);

        if tokio::time::timeout(grace, workers.as_mut()).await.is_err() {
            let interrupted = self.shared.interrupt_in_flight();
            warn!(
                "Interrupting {} attempts still running after {:?}",
                interrupted, grace
            );
            if tokio::time::timeout(grace, workers.as_mut()).await.is_err() {
                warn!("Workers did not stop after interruption");
            }
        }

        if let Some(completion) = tasks.completion.take() {
            if tokio::time::timeout(grace, completion).await.is_err() {
                warn!("Completion loop did not drain in time");
            }
        }

        self.shared.shutdown.cancel();
        if let Some(sweep) = tasks.sweep.take() {
            let _ = sweep.await;
        }

        info!("Job orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::AttemptOutcome;
    use crate::testing::{fixtures, MockPipelineRunner};

    use super::super::worker::AttemptReport;

    /// Submit a job and mark it running on this instance without a worker.
    async fn running_here(h: &fixtures::Harness) -> String {
        let outcome = h
            .orchestrator
            .submit(fixtures::fingerprint("report"), fixtures::csv_upload("r.csv"))
            .await
            .unwrap();
        let shared = &h.orchestrator.shared;
        let mut in_flight = shared.in_flight();
        let job = shared
            .transition(&outcome.job_id, Transition::new(JobStatus::Queued, JobStatus::Running))
            .unwrap();
        in_flight.insert(
            job.id.clone(),
            InFlight {
                attempt: job.attempt_count,
                token: CancellationToken::new(),
                reason: None,
            },
        );
        job.id
    }

    fn report(job_id: &str, outcome: AttemptOutcome) -> AttemptReport {
        AttemptReport {
            job_id: job_id.to_string(),
            attempt: 1,
            outcome,
            elapsed: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_success_reported_after_cancel_is_done() {
        let h = fixtures::harness(Arc::new(MockPipelineRunner::new()), fixtures::fast_config());
        let job_id = running_here(&h).await;
        let shared = &h.orchestrator.shared;

        let snapshot = shared.cancel(&job_id).unwrap();
        assert_eq!(snapshot.status, JobStatus::Running);

        shared.apply_report(report(&job_id, AttemptOutcome::Success));

        let job = h.orchestrator.get_status(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert!(job.last_error.is_none());
        assert!(shared.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_failure_reported_after_cancel_is_cancelled() {
        let h = fixtures::harness(Arc::new(MockPipelineRunner::new()), fixtures::fast_config());
        let job_id = running_here(&h).await;
        let shared = &h.orchestrator.shared;

        shared.cancel(&job_id).unwrap();
        shared.apply_report(report(&job_id, AttemptOutcome::retryable("stage process: cancelled")));

        let job = h.orchestrator.get_status(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.last_error.as_deref(), Some("cancelled on request"));
    }

    #[tokio::test]
    async fn test_report_for_superseded_attempt_is_ignored() {
        let h = fixtures::harness(Arc::new(MockPipelineRunner::new()), fixtures::fast_config());
        let job_id = running_here(&h).await;
        let shared = &h.orchestrator.shared;

        shared.apply_report(AttemptReport {
            attempt: 7,
            ..report(&job_id, AttemptOutcome::Success)
        });

        let job = h.orchestrator.get_status(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(shared.in_flight().len(), 1);
    }
}
