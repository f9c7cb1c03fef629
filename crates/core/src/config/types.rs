use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::orchestrator::OrchestratorConfig;
use crate::runner::RunnerConfig;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("upflow.db")
}

/// Upload directory scanning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    /// Directory producers drop uploads into
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    /// Accepted uploads are moved here as `<fingerprint>.<ext>`
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,
    /// Seconds between scans (default: 5)
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Lowercase extensions without the dot
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    /// Uploads larger than this are rejected (default: 50)
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
}

impl IngestConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    /// Returns true if the extension (any case) is accepted.
    pub fn allows_extension(&self, extension: &str) -> bool {
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(extension))
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            archive_dir: default_archive_dir(),
            scan_interval_secs: default_scan_interval(),
            allowed_extensions: default_allowed_extensions(),
            max_file_size_mb: default_max_file_size_mb(),
        }
    }
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_archive_dir() -> PathBuf {
    PathBuf::from("archive")
}

fn default_scan_interval() -> u64 {
    5
}

fn default_allowed_extensions() -> Vec<String> {
    vec!["csv".to_string(), "xlsx".to_string(), "xls".to_string()]
}

fn default_max_file_size_mb() -> u64 {
    50
}

/// Metrics export
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Prometheus text exposition is written here when set
    #[serde(default)]
    pub textfile_path: Option<PathBuf>,
    /// Seconds between writes (default: 15)
    #[serde(default = "default_metrics_interval")]
    pub write_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            textfile_path: None,
            write_interval_secs: default_metrics_interval(),
        }
    }
}

fn default_metrics_interval() -> u64 {
    15
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}
