//! Mock pipeline runner for testing.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::runner::{AttemptContext, AttemptOutcome, PipelineRunner};

/// What the mock does for one attempt.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Return the outcome immediately.
    Return(AttemptOutcome),
    /// Wait, then return the outcome. Cancellation cuts the wait short.
    Delay(Duration, AttemptOutcome),
    /// Block until the attempt is cancelled.
    Hang,
}

/// A recorded attempt for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedAttempt {
    pub job_id: String,
    pub attempt: u32,
    /// When the runner was invoked, on the tokio clock.
    pub started_at: Instant,
    /// Whether the attempt observed its cancellation signal.
    pub cancelled: bool,
}

/// Mock implementation of the PipelineRunner trait.
///
/// Steps are consumed in order across all jobs; once the script runs out
/// every attempt returns the default outcome (`Success` unless changed).
///
/// # Example
///
/// ```rust,ignore
/// use upflow_core::testing::MockPipelineRunner;
///
/// let runner = MockPipelineRunner::new();
/// runner.push_outcome(AttemptOutcome::retryable("disk full")).await;
///
/// // first attempt fails, the retry succeeds
/// let attempts = runner.recorded_attempts().await;
/// ```
#[derive(Debug)]
pub struct MockPipelineRunner {
    steps: Arc<RwLock<VecDeque<MockStep>>>,
    default_outcome: Arc<RwLock<AttemptOutcome>>,
    attempts: Arc<RwLock<Vec<RecordedAttempt>>>,
}

impl Default for MockPipelineRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPipelineRunner {
    /// Create a new mock runner that always succeeds.
    pub fn new() -> Self {
        Self {
            steps: Arc::new(RwLock::new(VecDeque::new())),
            default_outcome: Arc::new(RwLock::new(AttemptOutcome::Success)),
            attempts: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Queue a step.
    pub async fn push_step(&self, step: MockStep) {
        self.steps.write().await.push_back(step);
    }

    /// Queue an immediate outcome.
    pub async fn push_outcome(&self, outcome: AttemptOutcome) {
        self.push_step(MockStep::Return(outcome)).await;
    }

    /// Queue an attempt that blocks until cancelled.
    pub async fn push_hang(&self) {
        self.push_step(MockStep::Hang).await;
    }

    /// Outcome used once the script is exhausted.
    pub async fn set_default_outcome(&self, outcome: AttemptOutcome) {
        *self.default_outcome.write().await = outcome;
    }

    /// Get all recorded attempts.
    pub async fn recorded_attempts(&self) -> Vec<RecordedAttempt> {
        self.attempts.read().await.clone()
    }

    /// Recorded attempts for one job.
    pub async fn attempts_for(&self, job_id: &str) -> Vec<RecordedAttempt> {
        self.attempts
            .read()
            .await
            .iter()
            .filter(|a| a.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Get the number of attempts started.
    pub async fn attempt_count(&self) -> usize {
        self.attempts.read().await.len()
    }

    /// Wait until at least `count` attempts have started.
    pub async fn wait_for_attempts(&self, count: usize) {
        while self.attempt_count().await < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn mark_cancelled(&self, index: usize) {
        if let Some(attempt) = self.attempts.write().await.get_mut(index) {
            attempt.cancelled = true;
        }
    }
}

#[async_trait]
impl PipelineRunner for MockPipelineRunner {
    fn name(&self) -> &str {
        "mock"
    }

    async fn run(&self, ctx: AttemptContext) -> AttemptOutcome {
        let index = {
            let mut attempts = self.attempts.write().await;
            attempts.push(RecordedAttempt {
                job_id: ctx.job_id.clone(),
                attempt: ctx.attempt,
                started_at: Instant::now(),
                cancelled: false,
            });
            attempts.len() - 1
        };

        let step = self.steps.write().await.pop_front();
        let step = match step {
            Some(step) => step,
            None => MockStep::Return(self.default_outcome.read().await.clone()),
        };

        match step {
            MockStep::Return(outcome) => outcome,
            MockStep::Delay(delay, outcome) => {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        self.mark_cancelled(index).await;
                        AttemptOutcome::retryable("cancelled")
                    }
                    _ = tokio::time::sleep(delay) => outcome,
                }
            }
            MockStep::Hang => {
                ctx.cancel.cancelled().await;
                self.mark_cancelled(index).await;
                AttemptOutcome::retryable("cancelled")
            }
        }
    }
}
