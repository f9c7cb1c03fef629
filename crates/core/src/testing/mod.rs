//! Testing utilities: a scriptable pipeline runner and fixtures.
//!
//! # Example
//!
//! ```rust,ignore
//! use upflow_core::testing::{fixtures, MockPipelineRunner};
//!
//! let runner = Arc::new(MockPipelineRunner::new());
//! let harness = fixtures::harness(runner.clone(), fixtures::fast_config());
//! harness.orchestrator.start().await;
//! ```

mod mock_runner;

pub use mock_runner::{MockPipelineRunner, MockStep, RecordedAttempt};

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::classifier::ExtensionClassifier;
    use crate::dedup::SqliteDedupIndex;
    use crate::fingerprint::{fingerprint_bytes, Fingerprint};
    use crate::job::{Job, JobMetadata, JobStatus, JobStore, SqliteJobStore};
    use crate::orchestrator::{JobOrchestrator, OrchestratorConfig};
    use crate::runner::PipelineRunner;

    /// Fingerprint of a label, for tests that only need distinct keys.
    pub fn fingerprint(label: &str) -> Fingerprint {
        fingerprint_bytes(label.as_bytes())
    }

    /// Metadata for an uploaded CSV.
    pub fn csv_upload(name: &str) -> JobMetadata {
        JobMetadata::new(name).with_size(1024)
    }

    /// Default timings with a single worker and a short shutdown grace.
    pub fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            workers: 1,
            shutdown_grace_ms: 200,
            ..Default::default()
        }
    }

    /// An orchestrator over in-memory stores.
    pub struct Harness {
        pub orchestrator: JobOrchestrator,
        pub jobs: Arc<SqliteJobStore>,
        pub dedup: Arc<SqliteDedupIndex>,
    }

    /// Upper bound for [`Harness::wait_for_status`]. Long enough to cover
    /// every backoff delay under paused time.
    pub const WAIT_LIMIT: Duration = Duration::from_secs(300);

    impl Harness {
        /// Poll until the job reaches `status`, panicking after [`WAIT_LIMIT`].
        pub async fn wait_for_status(&self, job_id: &str, status: JobStatus) -> Job {
            self.wait_for_status_within(job_id, status, WAIT_LIMIT).await
        }

        /// Poll until the job reaches `status`, panicking after `limit`.
        pub async fn wait_for_status_within(
            &self,
            job_id: &str,
            status: JobStatus,
            limit: Duration,
        ) -> Job {
            let poll = async {
                loop {
                    let job = self
                        .jobs
                        .get(job_id)
                        .expect("job store")
                        .expect("job exists");
                    if job.status == status {
                        return job;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            };

            match tokio::time::timeout(limit, poll).await {
                Ok(job) => job,
                Err(_) => {
                    let last = self.jobs.get(job_id).ok().flatten().map(|job| job.status);
                    panic!(
                        "job {} did not reach {} within {:?} (last status: {:?})",
                        job_id, status, limit, last
                    );
                }
            }
        }
    }

    /// Build a harness over fresh in-memory stores.
    pub fn harness(runner: Arc<dyn PipelineRunner>, config: OrchestratorConfig) -> Harness {
        let jobs = Arc::new(SqliteJobStore::in_memory().expect("job store"));
        let dedup = Arc::new(SqliteDedupIndex::in_memory().expect("dedup index"));
        harness_with_stores(runner, config, jobs, dedup)
    }

    /// Build a harness over existing stores, e.g. to simulate a restart.
    pub fn harness_with_stores(
        runner: Arc<dyn PipelineRunner>,
        config: OrchestratorConfig,
        jobs: Arc<SqliteJobStore>,
        dedup: Arc<SqliteDedupIndex>,
    ) -> Harness {
        let orchestrator = JobOrchestrator::new(
            config,
            jobs.clone(),
            dedup.clone(),
            runner,
            Arc::new(ExtensionClassifier::new()),
            None,
        );
        Harness {
            orchestrator,
            jobs,
            dedup,
        }
    }
}
