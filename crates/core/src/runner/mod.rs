//! Pipeline runners.
//!
//! A [`PipelineRunner`] executes one attempt of a job and classifies the
//! result. [`CommandPipelineRunner`] runs the configured stages as
//! subprocesses.

mod command;
mod config;
mod traits;

pub use command::CommandPipelineRunner;
pub use config::{RunnerConfig, StageConfig};
pub use traits::{AttemptContext, AttemptOutcome, PipelineRunner};
