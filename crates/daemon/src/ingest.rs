//! Upload directory scanner.
//!
//! Producers drop files into `upload_dir`. Each scan validates them,
//! fingerprints the accepted ones, moves them to
//! `archive_dir/<fingerprint>.<ext>` and submits them to the orchestrator.
//! An upload leaves `upload_dir` only once its submission succeeded, so a
//! failed submission is retried on the next scan.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use upflow_core::{fingerprint_file, IngestConfig, JobMetadata, JobOrchestrator};

use crate::metrics::UPLOADS_SCANNED;

/// Subdirectory of `archive_dir` receiving rejected uploads.
const REJECTED_DIR: &str = "rejected";

/// What happened to one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanResult {
    Accepted { job_id: String },
    Duplicate { job_id: String, usage_count: u64 },
    Rejected(String),
}

impl ScanResult {
    fn label(&self) -> &'static str {
        match self {
            ScanResult::Accepted { .. } => "accepted",
            ScanResult::Duplicate { .. } => "duplicate",
            ScanResult::Rejected(_) => "rejected",
        }
    }
}

pub struct UploadScanner {
    config: IngestConfig,
    orchestrator: Arc<JobOrchestrator>,
}

impl UploadScanner {
    pub fn new(config: IngestConfig, orchestrator: Arc<JobOrchestrator>) -> Self {
        Self {
            config,
            orchestrator,
        }
    }

    /// Scan until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let period = Duration::from_secs(self.config.scan_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        info!(
            "Scanning {:?} every {:?}",
            self.config.upload_dir, period
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.scan_once().await {
                        error!("Upload scan failed: {:#}", e);
                    }
                }
            }
        }

        info!("Upload scanner stopped");
    }

    /// Process every file currently in the upload directory.
    pub async fn scan_once(&self) -> Result<Vec<(PathBuf, ScanResult)>> {
        tokio::fs::create_dir_all(&self.config.upload_dir)
            .await
            .with_context(|| format!("Failed to create {:?}", self.config.upload_dir))?;
        tokio::fs::create_dir_all(self.config.archive_dir.join(REJECTED_DIR))
            .await
            .with_context(|| format!("Failed to create {:?}", self.config.archive_dir))?;

        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.config.upload_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if !hidden && entry.file_type().await?.is_file() {
                paths.push(entry.path());
            }
        }
        paths.sort();

        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            match self.ingest_file(&path).await {
                Ok(result) => {
                    UPLOADS_SCANNED.with_label_values(&[result.label()]).inc();
                    results.push((path, result));
                }
                Err(e) => {
                    UPLOADS_SCANNED.with_label_values(&["error"]).inc();
                    warn!("Failed to ingest {:?}: {:#}", path, e);
                }
            }
        }

        Ok(results)
    }

    async fn ingest_file(&self, path: &Path) -> Result<ScanResult> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let size = tokio::fs::metadata(path).await?.len();

        if !self.config.allows_extension(&extension) {
            return self
                .reject(path, &file_name, format!("extension '{}' not allowed", extension))
                .await;
        }
        if size > self.config.max_file_size_bytes() {
            return self
                .reject(
                    path,
                    &file_name,
                    format!("{} bytes exceeds {} MB limit", size, self.config.max_file_size_mb),
                )
                .await;
        }

        let fingerprint = fingerprint_file(path).await?;
        let archived = self
            .config
            .archive_dir
            .join(format!("{}.{}", fingerprint, extension));

        // Same bytes already archived: the upload is dropped once submitted.
        let already_archived = tokio::fs::try_exists(&archived).await?;
        if !already_archived {
            move_file(path, &archived).await?;
        }

        let metadata = JobMetadata::new(file_name.clone())
            .with_source_path(archived.clone())
            .with_size(size);
        let outcome = match self.orchestrator.submit(fingerprint.clone(), metadata).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if !already_archived {
                    move_file(&archived, path)
                        .await
                        .with_context(|| format!("Failed to restore {:?} after {}", path, e))?;
                }
                return Err(e).with_context(|| format!("Failed to submit {}", file_name));
            }
        };

        if already_archived {
            tokio::fs::remove_file(path).await?;
        }

        if outcome.is_duplicate {
            info!(
                "Upload {} duplicates job {} ({}, seen {} times)",
                file_name, outcome.job_id, outcome.status, outcome.usage_count
            );
            Ok(ScanResult::Duplicate {
                job_id: outcome.job_id,
                usage_count: outcome.usage_count,
            })
        } else {
            info!(
                "Upload {} submitted as job {} ({})",
                file_name,
                outcome.job_id,
                fingerprint.short()
            );
            Ok(ScanResult::Accepted {
                job_id: outcome.job_id,
            })
        }
    }

    async fn reject(&self, path: &Path, file_name: &str, reason: String) -> Result<ScanResult> {
        warn!("Rejected upload {}: {}", file_name, reason);
        let target = self.config.archive_dir.join(REJECTED_DIR).join(file_name);
        move_file(path, &target).await?;
        Ok(ScanResult::Rejected(reason))
    }
}

/// Rename, falling back to copy and delete across filesystems.
async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    debug!("Rename {:?} -> {:?} failed, copying", from, to);
    tokio::fs::copy(from, to)
        .await
        .with_context(|| format!("Failed to copy {:?} to {:?}", from, to))?;
    tokio::fs::remove_file(from).await?;
    Ok(())
}
