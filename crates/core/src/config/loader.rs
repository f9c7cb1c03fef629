use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use std::path::Path;

use super::{types::Config, ConfigError};

/// Load configuration from file with environment variable overrides
///
/// `UPFLOW_ORCHESTRATOR__WORKERS=4` overrides `orchestrator.workers`.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let config: Config = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("UPFLOW_").ignore(&["CONFIG"]).split("__"))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    Ok(config)
}

/// Load configuration from TOML string (useful for testing)
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogFormat;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_from_str_empty_uses_defaults() {
        let config = load_config_from_str("").unwrap();
        assert_eq!(config.orchestrator.workers, 2);
        assert_eq!(config.orchestrator.max_attempts, 3);
        assert_eq!(config.ingest.max_file_size_mb, 50);
        assert_eq!(config.runner.stages.len(), 2);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.metrics.textfile_path.is_none());
    }

    #[test]
    fn test_load_config_from_str_valid() {
        let toml = r#"
log_format = "json"

[orchestrator]
workers = 8
stale_after_secs = 600

[ingest]
upload_dir = "/srv/uploads"
allowed_extensions = ["csv"]

[[runner.stages]]
name = "normalize"
program = "normalize"
args = ["{input}"]
"#;
        let config = load_config_from_str(toml).unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.orchestrator.workers, 8);
        assert_eq!(config.orchestrator.stale_after_secs, 600);
        assert_eq!(config.orchestrator.retry_base_delay_secs, 30);
        assert_eq!(config.ingest.upload_dir.to_str(), Some("/srv/uploads"));
        assert!(config.ingest.allows_extension("CSV"));
        assert!(!config.ingest.allows_extension("xlsx"));
        assert_eq!(config.runner.stages.len(), 1);
        assert_eq!(config.runner.stages[0].timeout_secs, 3600);
    }

    #[test]
    fn test_load_config_from_str_bad_type() {
        let toml = r#"
[orchestrator]
workers = "many"
"#;
        let result = load_config_from_str(toml);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/upflow.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
[database]
path = "/var/lib/upflow/jobs.db"

[orchestrator]
max_attempts = 5
"#
        )
        .unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.database.path.to_str(), Some("/var/lib/upflow/jobs.db"));
        assert_eq!(config.orchestrator.max_attempts, 5);
    }
}
