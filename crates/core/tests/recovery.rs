//! Staleness sweep, restart recovery and shutdown tests.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use upflow_core::{
    create_audit_system,
    job::{CreateJobRequest, Transition},
    testing::{fixtures, MockPipelineRunner},
    AuditFilter, AuditStore, ExtensionClassifier, JobOrchestrator, JobStatus, JobStore,
    SqliteAuditStore, SqliteDedupIndex, SqliteJobStore,
};

fn running_job(jobs: &SqliteJobStore, label: &str) -> String {
    let job = jobs
        .create(CreateJobRequest {
            fingerprint: fixtures::fingerprint(label),
            metadata: fixtures::csv_upload(label),
            max_attempts: 3,
        })
        .unwrap();
    jobs.compare_and_transition(&job.id, Transition::new(JobStatus::Queued, JobStatus::Running))
        .unwrap();
    job.id
}

#[tokio::test(start_paused = true)]
async fn test_sweep_reclaims_hung_attempt() {
    let runner = Arc::new(MockPipelineRunner::new());
    runner.push_hang().await;

    let h = fixtures::harness(runner.clone(), fixtures::fast_config());
    h.orchestrator.start().await;

    let outcome = h
        .orchestrator
        .submit(fixtures::fingerprint("stuck"), fixtures::csv_upload("stuck.csv"))
        .await
        .unwrap();
    runner.wait_for_attempts(1).await;
    h.wait_for_status(&outcome.job_id, JobStatus::Running).await;

    // Nothing is stale yet.
    assert_eq!(h.orchestrator.sweep_at(Utc::now()), 0);

    let reclaimed = h
        .orchestrator
        .sweep_at(Utc::now() + ChronoDuration::hours(3));
    assert_eq!(reclaimed, 1);

    let job = h.orchestrator.get_status(&outcome.job_id).unwrap();
    assert_eq!(job.status, JobStatus::Retrying);
    assert_eq!(job.attempt_count, 1);
    assert!(job.last_error.unwrap().contains("orphaned"));

    // The reclaimed attempt is signalled; the retry then succeeds.
    let done = h.wait_for_status(&outcome.job_id, JobStatus::Done).await;
    assert_eq!(done.attempt_count, 2);
    assert!(runner.attempts_for(&outcome.job_id).await[0].cancelled);

    h.orchestrator.stop().await;
}

#[tokio::test]
async fn test_sweep_reclaims_orphan_without_worker() {
    let runner = Arc::new(MockPipelineRunner::new());
    let h = fixtures::harness(runner, fixtures::fast_config());
    let job_id = running_job(&h.jobs, "orphan");

    assert_eq!(h.orchestrator.sweep_at(Utc::now()), 0);
    assert_eq!(
        h.orchestrator.sweep_at(Utc::now() + ChronoDuration::hours(2) + ChronoDuration::minutes(1)),
        1
    );

    let job = h.jobs.get(&job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Retrying);
    assert!(job.retry_at.is_some());

    // A second sweep finds nothing left to reclaim.
    assert_eq!(h.orchestrator.sweep_at(Utc::now() + ChronoDuration::hours(3)), 0);
}

#[tokio::test]
async fn test_sweep_fails_orphan_on_last_attempt() {
    let runner = Arc::new(MockPipelineRunner::new());
    let h = fixtures::harness(runner, fixtures::fast_config());

    let job = h
        .jobs
        .create(CreateJobRequest {
            fingerprint: fixtures::fingerprint("last chance"),
            metadata: fixtures::csv_upload("last.csv"),
            max_attempts: 1,
        })
        .unwrap();
    h.jobs
        .compare_and_transition(&job.id, Transition::new(JobStatus::Queued, JobStatus::Running))
        .unwrap();

    assert_eq!(h.orchestrator.sweep_at(Utc::now() + ChronoDuration::hours(3)), 1);
    assert_eq!(
        h.jobs.get(&job.id).unwrap().unwrap().status,
        JobStatus::Failed
    );
}

#[tokio::test(start_paused = true)]
async fn test_start_recovers_persisted_jobs() {
    let jobs = Arc::new(SqliteJobStore::in_memory().unwrap());
    let dedup = Arc::new(SqliteDedupIndex::in_memory().unwrap());

    // State left behind by a previous process.
    let orphan_id = running_job(&jobs, "orphan");
    let queued = jobs
        .create(CreateJobRequest {
            fingerprint: fixtures::fingerprint("waiting"),
            metadata: fixtures::csv_upload("waiting.csv"),
            max_attempts: 3,
        })
        .unwrap();

    let runner = Arc::new(MockPipelineRunner::new());
    let h = fixtures::harness_with_stores(runner.clone(), fixtures::fast_config(), jobs, dedup);
    h.orchestrator.start().await;

    h.wait_for_status(&queued.id, JobStatus::Done).await;

    let orphan = h.wait_for_status(&orphan_id, JobStatus::Done).await;
    assert_eq!(orphan.attempt_count, 2);
    assert_eq!(runner.attempts_for(&orphan_id).await.len(), 1);

    h.orchestrator.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_leaves_retrying_job_for_next_start() {
    let jobs = Arc::new(SqliteJobStore::in_memory().unwrap());
    let dedup = Arc::new(SqliteDedupIndex::in_memory().unwrap());

    let runner = Arc::new(MockPipelineRunner::new());
    runner
        .push_outcome(upflow_core::AttemptOutcome::retryable("upstream 503"))
        .await;

    let first = fixtures::harness_with_stores(
        runner.clone(),
        fixtures::fast_config(),
        jobs.clone(),
        dedup.clone(),
    );
    first.orchestrator.start().await;

    let outcome = first
        .orchestrator
        .submit(fixtures::fingerprint("survivor"), fixtures::csv_upload("s.csv"))
        .await
        .unwrap();
    first
        .wait_for_status(&outcome.job_id, JobStatus::Retrying)
        .await;
    first.orchestrator.stop().await;
    assert!(!first.orchestrator.is_running());

    tokio::time::sleep(std::time::Duration::from_secs(120)).await;
    assert_eq!(
        jobs.get(&outcome.job_id).unwrap().unwrap().status,
        JobStatus::Retrying
    );

    let second = fixtures::harness_with_stores(runner.clone(), fixtures::fast_config(), jobs, dedup);
    second.orchestrator.start().await;

    let done = second.wait_for_status(&outcome.job_id, JobStatus::Done).await;
    assert_eq!(done.attempt_count, 2);

    second.orchestrator.stop().await;
}

#[tokio::test]
async fn test_stop_interrupts_attempts_after_grace() {
    let runner = Arc::new(MockPipelineRunner::new());
    runner.push_hang().await;

    let h = fixtures::harness(runner.clone(), fixtures::fast_config());
    h.orchestrator.start().await;

    let outcome = h
        .orchestrator
        .submit(fixtures::fingerprint("slow"), fixtures::csv_upload("slow.csv"))
        .await
        .unwrap();
    runner.wait_for_attempts(1).await;

    h.orchestrator.stop().await;

    assert!(runner.recorded_attempts().await[0].cancelled);
    // Interrupted attempts stay running until the next start reclaims them.
    assert_eq!(
        h.jobs.get(&outcome.job_id).unwrap().unwrap().status,
        JobStatus::Running
    );
}

#[tokio::test]
async fn test_lifecycle_is_audited() {
    let audit_store = Arc::new(SqliteAuditStore::in_memory().unwrap());
    let (audit, writer) = create_audit_system(audit_store.clone(), 100);
    tokio::spawn(writer.run());

    let jobs = Arc::new(SqliteJobStore::in_memory().unwrap());
    let runner = Arc::new(MockPipelineRunner::new());
    let orchestrator = JobOrchestrator::new(
        fixtures::fast_config(),
        jobs.clone(),
        Arc::new(SqliteDedupIndex::in_memory().unwrap()),
        runner,
        Arc::new(ExtensionClassifier::new()),
        Some(audit),
    );
    orchestrator.start().await;

    let outcome = orchestrator
        .submit(fixtures::fingerprint("audited"), fixtures::csv_upload("a.csv"))
        .await
        .unwrap();

    // submitted, queued -> running, running -> done
    let filter = AuditFilter::new().with_job_id(outcome.job_id.clone());
    loop {
        if audit_store.count(&filter).unwrap() >= 3 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let events: Vec<_> = audit_store
        .query(&filter)
        .unwrap()
        .into_iter()
        .map(|r| r.event_type)
        .collect();
    assert!(events.contains(&"job_submitted".to_string()));
    assert!(events.contains(&"job_state_changed".to_string()));

    orchestrator.stop().await;
}
