//! Staleness sweep and startup recovery.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::audit::AuditEvent;
use crate::job::{Job, JobError, JobFilter, JobStatus, Transition};
use crate::metrics;

use super::runner::Shared;
use super::types::CancelReason;

/// Upper bound on jobs loaded per status by one sweep or recovery pass.
const SCAN_LIMIT: i64 = 10_000;

impl Shared {
    fn jobs_in(&self, status: JobStatus) -> Result<Vec<Job>, JobError> {
        self.store.list(
            &JobFilter::new()
                .with_status(status)
                .oldest_first()
                .with_limit(SCAN_LIMIT),
        )
    }

    /// Reclaim running attempts that started before `now - stale_after`.
    ///
    /// An attempt whose heartbeat also went quiet is an orphan; one that is
    /// still beating has simply run too long. Both count as a failed attempt
    /// and are retried within the job's budget. A local attempt is cancelled
    /// first, so its late report is ignored.
    pub(super) fn sweep_at(self: &Arc<Self>, now: DateTime<Utc>) -> usize {
        let stale_after = chrono::Duration::from_std(self.config.stale_after())
            .unwrap_or_else(|_| chrono::Duration::hours(2));
        let cutoff = now - stale_after;

        let running = match self.jobs_in(JobStatus::Running) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("Staleness sweep failed to list running jobs: {}", e);
                return 0;
            }
        };

        let mut reclaimed = 0;
        for job in running {
            let started = job.started_at.unwrap_or(job.submitted_at);
            if started >= cutoff {
                continue;
            }

            let beating = job.heartbeat_at.is_some_and(|at| at >= cutoff);
            let reason = if beating {
                format!(
                    "attempt {} exceeded the {}s staleness threshold",
                    job.attempt_count,
                    stale_after.num_seconds()
                )
            } else {
                format!("attempt {} orphaned: no heartbeat", job.attempt_count)
            };

            let mut in_flight = self.in_flight();
            let current = in_flight
                .get(&job.id)
                .is_some_and(|entry| entry.attempt == job.attempt_count);
            let local = if current { in_flight.remove(&job.id) } else { None };
            metrics::IN_FLIGHT.set(in_flight.len() as i64);

            let result = match local {
                Some(entry) => {
                    entry.token.cancel();
                    if entry.reason == Some(CancelReason::User) {
                        self.transition(
                            &job.id,
                            Transition::new(JobStatus::Running, JobStatus::Cancelled)
                                .for_attempt(job.attempt_count)
                                .with_error("cancelled on request"),
                        )
                    } else {
                        self.fail_attempt(&job.id, job.attempt_count, &reason)
                    }
                }
                None => self.fail_attempt(&job.id, job.attempt_count, &reason),
            };
            drop(in_flight);

            if result.is_ok() {
                warn!("Reclaimed job {}: {}", job.id, reason);
                self.record_reclaim(&job);
                reclaimed += 1;
            }
        }

        reclaimed
    }

    fn record_reclaim(&self, job: &Job) {
        metrics::ORPHANS_RECLAIMED.inc();
        self.emit(AuditEvent::OrphanReclaimed {
            job_id: job.id.clone(),
            attempt: job.attempt_count,
            last_heartbeat: job.heartbeat_at,
        });
    }

    /// Periodic sweep until shutdown.
    pub(super) async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval().max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let reclaimed = self.sweep_at(Utc::now());
                    if reclaimed > 0 {
                        info!("Staleness sweep reclaimed {} attempts", reclaimed);
                    }
                }
            }
        }

        debug!("Staleness sweep stopped");
    }

    /// Rebuild in-memory state from the store before workers start.
    ///
    /// Retrying jobs get their timers back, running jobs are orphans of a
    /// previous process, and queued jobs re-enter the queue oldest first.
    pub(super) fn recover(self: &Arc<Self>) -> Result<(), JobError> {
        let now = Utc::now();

        // Before reclaiming orphans, which schedule their own timers.
        let retrying = self.jobs_in(JobStatus::Retrying)?;
        for job in &retrying {
            let delay = job
                .retry_at
                .and_then(|at| (at - now).to_std().ok())
                .unwrap_or(Duration::ZERO);
            self.schedule_retry(job.id.clone(), delay);
        }

        let running = self.jobs_in(JobStatus::Running)?;
        for job in &running {
            let reason = format!("attempt {} orphaned: process restarted", job.attempt_count);
            if self.fail_attempt(&job.id, job.attempt_count, &reason).is_ok() {
                warn!("Reclaimed job {}: {}", job.id, reason);
                self.record_reclaim(job);
            }
        }

        let queued = self.jobs_in(JobStatus::Queued)?;
        for job in &queued {
            self.queue.push(&job.id);
        }

        info!(
            "Recovered {} queued, {} retrying and {} orphaned jobs",
            queued.len(),
            retrying.len(),
            running.len()
        );
        Ok(())
    }
}
