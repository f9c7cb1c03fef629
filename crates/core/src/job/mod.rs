//! Jobs: the persisted units of work and their state machine.

mod sqlite_store;
mod store;
mod types;

pub use sqlite_store::SqliteJobStore;
pub use store::{CreateJobRequest, JobError, JobFilter, JobStore, Transition};
pub use types::{Job, JobMetadata, JobStatus, ParseStatusError};
