//! Job orchestrator.
//!
//! Drives jobs through the state machine:
//! - **Admission**: deduplicated by fingerprint, serialized per fingerprint
//! - **Dispatch**: a fixed pool of workers pulls from a FIFO ready queue
//! - **Retry**: transient failures re-enter the queue after an exponential backoff
//! - **Sweep**: attempts running past the staleness threshold are reclaimed

mod admission;
mod config;
mod queue;
mod retry;
mod runner;
mod sweep;
mod types;
mod worker;

pub use config::OrchestratorConfig;
pub use retry::RetryPolicy;
pub use runner::JobOrchestrator;
pub use types::{OrchestratorError, QueueStatus, SubmitOutcome};
