use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Worker pool and attempt budget are non-zero
/// - Retry base delay does not exceed the max delay
/// - Sweep interval is non-zero
/// - Every runner stage names a program
/// - At least one upload extension is allowed
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let orchestrator = &config.orchestrator;

    if orchestrator.workers == 0 {
        return Err(invalid("orchestrator.workers cannot be 0"));
    }
    if orchestrator.max_attempts == 0 {
        return Err(invalid("orchestrator.max_attempts cannot be 0"));
    }
    if orchestrator.retry_base_delay_secs > orchestrator.retry_max_delay_secs {
        return Err(invalid(
            "orchestrator.retry_base_delay_secs cannot exceed retry_max_delay_secs",
        ));
    }
    if orchestrator.sweep_interval_secs == 0 {
        return Err(invalid("orchestrator.sweep_interval_secs cannot be 0"));
    }

    if let Some(stage) = config
        .runner
        .stages
        .iter()
        .find(|stage| stage.program.trim().is_empty())
    {
        return Err(ConfigError::ValidationError(format!(
            "runner stage '{}' has no program",
            stage.name
        )));
    }

    if config.ingest.allowed_extensions.is_empty() {
        return Err(invalid("ingest.allowed_extensions cannot be empty"));
    }

    Ok(())
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::ValidationError(message.to_string())
}
