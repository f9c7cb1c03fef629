//! Subprocess-based pipeline runner.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use super::config::{RunnerConfig, StageConfig};
use super::traits::{AttemptContext, AttemptOutcome, PipelineRunner};

/// Longest stderr excerpt carried into `last_error`.
const MAX_STDERR_CHARS: usize = 1000;

/// Runs the configured stages as subprocesses, in order.
///
/// Exit codes listed in `fatal_exit_codes` and missing programs are fatal.
/// Other non-zero exits, I/O errors and timeouts are retryable. Cancellation
/// kills the running child.
pub struct CommandPipelineRunner {
    config: RunnerConfig,
}

/// Values substituted into stage arguments.
struct StageVars<'a> {
    input: &'a Path,
    output_dir: &'a Path,
    job_id: &'a str,
    dataset_type: &'a str,
}

impl StageVars<'_> {
    fn expand(&self, arg: &str) -> String {
        arg.replace("{input}", &self.input.to_string_lossy())
            .replace("{output_dir}", &self.output_dir.to_string_lossy())
            .replace("{job_id}", self.job_id)
            .replace("{dataset_type}", self.dataset_type)
    }
}

impl CommandPipelineRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Directory a job's stages write into.
    pub fn job_output_dir(&self, job_id: &str) -> PathBuf {
        self.config.output_dir.join(job_id)
    }

    async fn run_stage(
        &self,
        stage: &StageConfig,
        vars: &StageVars<'_>,
        ctx: &AttemptContext,
    ) -> Result<(), AttemptOutcome> {
        let args: Vec<String> = stage.args.iter().map(|a| vars.expand(a)).collect();
        debug!("Job {}: stage {} running {} {:?}", ctx.job_id, stage.name, stage.program, args);

        let child = Command::new(&stage.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    AttemptOutcome::fatal(format!(
                        "stage {}: program not found: {}",
                        stage.name, stage.program
                    ))
                } else {
                    AttemptOutcome::retryable(format!("stage {}: failed to start: {}", stage.name, e))
                }
            })?;

        // Dropping the wait future drops the child, which kills it.
        let limit = Duration::from_secs(stage.timeout_secs);
        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(AttemptOutcome::retryable(format!("stage {}: cancelled", stage.name)));
            }
            result = timeout(limit, child.wait_with_output()) => result,
        };

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(AttemptOutcome::retryable(format!("stage {}: {}", stage.name, e)));
            }
            Err(_) => {
                return Err(AttemptOutcome::retryable(format!(
                    "stage {}: timed out after {} seconds",
                    stage.name, stage.timeout_secs
                )));
            }
        };

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = match output.status.code() {
            Some(code) => format!(
                "stage {} exited with code {}: {}",
                stage.name,
                code,
                tail(stderr.trim(), MAX_STDERR_CHARS)
            ),
            None => format!("stage {} terminated by signal", stage.name),
        };

        match output.status.code() {
            Some(code) if self.config.fatal_exit_codes.contains(&code) => {
                Err(AttemptOutcome::Fatal(reason))
            }
            _ => Err(AttemptOutcome::Retryable(reason)),
        }
    }
}

#[async_trait]
impl PipelineRunner for CommandPipelineRunner {
    fn name(&self) -> &str {
        "command"
    }

    async fn run(&self, ctx: AttemptContext) -> AttemptOutcome {
        let Some(input) = ctx.metadata.source_path.clone() else {
            return AttemptOutcome::fatal("upload has no source path");
        };

        if !input.exists() {
            return AttemptOutcome::fatal(format!("input file missing: {}", input.display()));
        }

        let output_dir = self.job_output_dir(&ctx.job_id);
        if let Err(e) = tokio::fs::create_dir_all(&output_dir).await {
            return AttemptOutcome::retryable(format!(
                "failed to create {}: {}",
                output_dir.display(),
                e
            ));
        }

        let dataset_type = ctx.metadata.dataset_type.clone().unwrap_or_else(|| "unknown".to_string());
        let vars = StageVars {
            input: &input,
            output_dir: &output_dir,
            job_id: &ctx.job_id,
            dataset_type: &dataset_type,
        };

        for stage in &self.config.stages {
            info!("Job {}: attempt {} starting stage {}", ctx.job_id, ctx.attempt, stage.name);
            if let Err(outcome) = self.run_stage(stage, &vars, &ctx).await {
                warn!("Job {}: stage {} failed ({})", ctx.job_id, stage.name, outcome.label());
                return outcome;
            }
        }

        AttemptOutcome::Success
    }
}

/// Last `max` characters of `s`.
fn tail(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    match s.char_indices().nth(count - max) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}
