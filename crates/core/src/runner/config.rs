//! Configuration for the command pipeline runner.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration for [`CommandPipelineRunner`](super::CommandPipelineRunner).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Root directory for per-job outputs.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Exit codes that mean the input can never be processed.
    #[serde(default = "default_fatal_exit_codes")]
    pub fatal_exit_codes: Vec<i32>,

    /// Stages run in order for each attempt.
    #[serde(default = "default_stages")]
    pub stages: Vec<StageConfig>,
}

/// One pipeline stage, executed as a subprocess.
///
/// Arguments may contain the placeholders `{input}`, `{output_dir}`,
/// `{job_id}` and `{dataset_type}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageConfig {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_stage_timeout")]
    pub timeout_secs: u64,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_fatal_exit_codes() -> Vec<i32> {
    // EX_DATAERR from sysexits.h
    vec![65]
}

fn default_stage_timeout() -> u64 {
    3600
}

fn default_stages() -> Vec<StageConfig> {
    vec![
        StageConfig {
            name: "process".to_string(),
            program: "python3".to_string(),
            args: [
                "process_data.py",
                "--raw",
                "{input}",
                "--out_dir",
                "{output_dir}",
                "--job_id",
                "{job_id}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            timeout_secs: 3600,
        },
        StageConfig {
            name: "dashboard".to_string(),
            program: "python3".to_string(),
            args: ["generate_dashboard.py", "--job_id", "{job_id}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            timeout_secs: 300,
        },
    ]
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            fatal_exit_codes: default_fatal_exit_codes(),
            stages: default_stages(),
        }
    }
}
