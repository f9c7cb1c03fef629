//! Trait definitions for the runner module.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::job::JobMetadata;

/// Everything a runner gets for one attempt.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub job_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub metadata: JobMetadata,
    /// Set when the attempt should stop. Runners must return promptly once
    /// it fires; the outcome they return is then ignored.
    pub cancel: CancellationToken,
}

/// Result of one attempt, as classified by the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    /// Transient failure; the job may be retried.
    Retryable(String),
    /// The input can never be processed; the job errors out immediately.
    Fatal(String),
}

impl AttemptOutcome {
    pub fn retryable(reason: impl Into<String>) -> Self {
        AttemptOutcome::Retryable(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        AttemptOutcome::Fatal(reason.into())
    }

    /// Label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Retryable(_) => "retryable",
            AttemptOutcome::Fatal(_) => "fatal",
        }
    }
}

/// Executes the processing pipeline for a job.
///
/// Invoked once per attempt. Implementations classify their own failures;
/// the orchestrator never inspects the cause.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    /// Returns the name of this runner implementation.
    fn name(&self) -> &str;

    /// Run one attempt.
    async fn run(&self, ctx: AttemptContext) -> AttemptOutcome;
}
