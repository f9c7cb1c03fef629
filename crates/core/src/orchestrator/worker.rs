//! Worker loops and the completion loop that applies attempt outcomes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::job::{JobStatus, Transition};
use crate::metrics;
use crate::runner::{AttemptContext, AttemptOutcome};

use super::runner::{InFlight, Shared};
use super::types::CancelReason;

/// What a worker hands back after an attempt returns.
#[derive(Debug)]
pub(super) struct AttemptReport {
    pub job_id: String,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub elapsed: Duration,
}

/// Pull job ids until the queue closes, running one attempt at a time.
pub(super) async fn worker_loop(
    shared: Arc<Shared>,
    worker_id: usize,
    reports: mpsc::Sender<AttemptReport>,
) {
    debug!("Worker {} started", worker_id);

    while let Some(job_id) = shared.queue.pop().await {
        if let Some(report) = run_attempt(&shared, worker_id, &job_id).await {
            if reports.send(report).await.is_err() {
                warn!("Worker {}: completion loop gone, dropping report for {}", worker_id, job_id);
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

async fn run_attempt(shared: &Shared, worker_id: usize, job_id: &str) -> Option<AttemptReport> {
    // A cancelled id can still be popped in the window before removal.
    match shared.store.get(job_id) {
        Ok(Some(job)) if job.status == JobStatus::Queued => {}
        Ok(_) => {
            debug!("Worker {}: job {} is no longer queued, skipping", worker_id, job_id);
            return None;
        }
        Err(e) => {
            warn!("Worker {}: failed to load job {}: {}", worker_id, job_id, e);
            return None;
        }
    }

    let (job, token) = {
        let mut in_flight = shared.in_flight();
        let job = shared
            .transition(job_id, Transition::new(JobStatus::Queued, JobStatus::Running))
            .ok()?;
        let token = CancellationToken::new();
        in_flight.insert(
            job.id.clone(),
            InFlight {
                attempt: job.attempt_count,
                token: token.clone(),
                reason: None,
            },
        );
        metrics::IN_FLIGHT.set(in_flight.len() as i64);
        (job, token)
    };

    info!(
        "Worker {}: running job {} attempt {}/{} with {}",
        worker_id,
        job.id,
        job.attempt_count,
        job.max_attempts,
        shared.runner.name()
    );

    let ctx = AttemptContext {
        job_id: job.id.clone(),
        attempt: job.attempt_count,
        metadata: job.metadata.clone(),
        cancel: token,
    };

    let started = Instant::now();
    let run = shared.runner.run(ctx);
    tokio::pin!(run);

    let mut heartbeat = tokio::time::interval(shared.config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; entering running already stamped it.
    heartbeat.tick().await;

    let outcome = loop {
        tokio::select! {
            outcome = &mut run => break outcome,
            _ = heartbeat.tick() => {
                match shared.store.record_heartbeat(&job.id, job.attempt_count) {
                    Ok(true) => {}
                    Ok(false) => debug!("Job {}: attempt {} no longer current", job.id, job.attempt_count),
                    Err(e) => warn!("Job {}: failed to record heartbeat: {}", job.id, e),
                }
            }
        }
    };

    Some(AttemptReport {
        job_id: job.id,
        attempt: job.attempt_count,
        outcome,
        elapsed: started.elapsed(),
    })
}

/// Apply reports until every worker has exited.
pub(super) async fn completion_loop(shared: Arc<Shared>, mut reports: mpsc::Receiver<AttemptReport>) {
    while let Some(report) = reports.recv().await {
        shared.apply_report(report);
    }
    debug!("Completion loop stopped");
}

impl Shared {
    /// Turn an attempt outcome into the next job state.
    ///
    /// Reports for attempts that were reclaimed meanwhile are ignored.
    pub(super) fn apply_report(self: &Arc<Self>, report: AttemptReport) {
        let mut in_flight = self.in_flight();
        let current = in_flight
            .get(&report.job_id)
            .is_some_and(|entry| entry.attempt == report.attempt);
        let entry = if current {
            in_flight.remove(&report.job_id)
        } else {
            None
        };
        metrics::IN_FLIGHT.set(in_flight.len() as i64);

        let Some(entry) = entry else {
            debug!(
                "Job {}: ignoring late report from reclaimed attempt {}",
                report.job_id, report.attempt
            );
            return;
        };

        // Runners only report success for a pipeline that ran to completion,
        // so a cancel signalled after the fact does not undo it.
        let reason = match report.outcome {
            AttemptOutcome::Success => None,
            _ => entry.reason,
        };

        if reason == Some(CancelReason::Shutdown) {
            drop(in_flight);
            info!(
                "Job {}: attempt {} interrupted by shutdown, left running for reclaim",
                report.job_id, report.attempt
            );
            metrics::ATTEMPTS.with_label_values(&["interrupted"]).inc();
            return;
        }
        if reason.is_none() && entry.reason.is_some() {
            debug!(
                "Job {}: attempt {} finished before its cancellation took effect",
                report.job_id, report.attempt
            );
        }

        let done = Transition::new(JobStatus::Running, JobStatus::Done).for_attempt(report.attempt);
        let (label, result) = match (reason, &report.outcome) {
            (Some(_), _) => (
                "cancelled",
                self.transition(
                    &report.job_id,
                    Transition {
                        to: JobStatus::Cancelled,
                        ..done
                    }
                    .with_error("cancelled on request"),
                ),
            ),
            (None, AttemptOutcome::Success) => (report.outcome.label(), self.transition(&report.job_id, done)),
            (None, AttemptOutcome::Retryable(reason)) => (
                report.outcome.label(),
                self.fail_attempt(&report.job_id, report.attempt, reason),
            ),
            (None, AttemptOutcome::Fatal(reason)) => (
                report.outcome.label(),
                self.transition(
                    &report.job_id,
                    Transition {
                        to: JobStatus::Error,
                        ..done
                    }
                    .with_error(reason.clone()),
                ),
            ),
        };
        drop(in_flight);

        metrics::ATTEMPTS.with_label_values(&[label]).inc();
        metrics::ATTEMPT_DURATION
            .with_label_values(&[label])
            .observe(report.elapsed.as_secs_f64());

        if let Err(e) = result {
            warn!("Job {}: failed to record attempt outcome: {}", report.job_id, e);
        }
    }
}
