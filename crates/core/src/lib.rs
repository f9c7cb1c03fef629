pub mod audit;
pub mod classifier;
pub mod config;
pub mod dedup;
pub mod fingerprint;
pub mod job;
pub mod metrics;
pub mod orchestrator;
pub mod runner;
pub mod testing;

pub use audit::{
    create_audit_system, AuditError, AuditEvent, AuditFilter, AuditHandle, AuditRecord,
    AuditStore, AuditWriter, SqliteAuditStore,
};
pub use classifier::{Classifier, ExtensionClassifier};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, IngestConfig,
    LogFormat, MetricsConfig,
};
pub use dedup::{
    DedupError, DedupIndex, DedupRecord, DuplicateConfidence, DuplicateReport, SqliteDedupIndex,
};
pub use fingerprint::{fingerprint_bytes, fingerprint_file, Fingerprint, FingerprintError};
pub use job::{
    Job, JobError, JobFilter, JobMetadata, JobStatus, JobStore, ParseStatusError, SqliteJobStore,
};
pub use orchestrator::{
    JobOrchestrator, OrchestratorConfig, OrchestratorError, QueueStatus, RetryPolicy,
    SubmitOutcome,
};
pub use runner::{
    AttemptContext, AttemptOutcome, CommandPipelineRunner, PipelineRunner, RunnerConfig,
    StageConfig,
};
