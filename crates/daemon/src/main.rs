mod ingest;
mod metrics;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use upflow_core::{
    create_audit_system, load_config, validate_config, AuditEvent, AuditStore,
    CommandPipelineRunner, Config, DedupIndex, ExtensionClassifier, JobOrchestrator, JobStore,
    LogFormat, PipelineRunner, SqliteAuditStore, SqliteDedupIndex, SqliteJobStore,
};

use ingest::UploadScanner;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Buffer size for audit event channel
const AUDIT_BUFFER_SIZE: usize = 1000;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());

    match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

async fn run() -> Result<()> {
    // Determine config path
    let config_path = std::env::var("UPFLOW_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("upflow.toml"));

    // Load configuration; a missing file means defaults
    let config = if config_path.exists() {
        load_config(&config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        Config::default()
    };

    init_logging(config.log_format);

    if !config_path.exists() {
        warn!("No configuration at {:?}, using defaults", config_path);
    }

    // Validate configuration
    validate_config(&config).context("Configuration validation failed")?;

    info!("Configuration loaded successfully");
    info!("Database path: {:?}", config.database.path);
    info!(
        "Workers: {}, max attempts: {}",
        config.orchestrator.workers, config.orchestrator.max_attempts
    );

    // Compute config hash for audit
    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    let config_hash_short = &config_hash[..16];

    // Create SQLite stores
    let audit_store: Arc<dyn AuditStore> = Arc::new(
        SqliteAuditStore::new(&config.database.path).context("Failed to create audit store")?,
    );
    let job_store: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::new(&config.database.path).context("Failed to create job store")?,
    );
    let dedup_index: Arc<dyn DedupIndex> = Arc::new(
        SqliteDedupIndex::new(&config.database.path).context("Failed to create dedup index")?,
    );
    info!("Stores initialized");

    // Create audit system
    let (audit_handle, audit_writer) =
        create_audit_system(Arc::clone(&audit_store), AUDIT_BUFFER_SIZE);

    // Spawn audit writer task
    let writer_handle = tokio::spawn(audit_writer.run());

    // Emit ServiceStarted event
    audit_handle
        .emit(AuditEvent::ServiceStarted {
            version: VERSION.to_string(),
            config_hash: config_hash_short.to_string(),
        })
        .await;

    // Create pipeline runner
    let runner: Arc<dyn PipelineRunner> =
        Arc::new(CommandPipelineRunner::new(config.runner.clone()));
    info!(
        "Pipeline runner: {} ({} stages)",
        runner.name(),
        config.runner.stages.len()
    );

    // Create and start orchestrator
    let orchestrator = Arc::new(JobOrchestrator::new(
        config.orchestrator.clone(),
        job_store,
        dedup_index,
        runner,
        Arc::new(ExtensionClassifier::new()),
        Some(audit_handle.clone()),
    ));
    orchestrator.start().await;

    // Background tasks stop on this token
    let shutdown = CancellationToken::new();

    let scanner = UploadScanner::new(config.ingest.clone(), Arc::clone(&orchestrator));
    let scanner_handle = tokio::spawn(scanner.run(shutdown.clone()));

    let metrics_handle = config.metrics.textfile_path.clone().map(|path| {
        let orchestrator = Arc::clone(&orchestrator);
        let period = Duration::from_secs(config.metrics.write_interval_secs.max(1));
        let shutdown = shutdown.clone();
        info!("Writing metrics to {:?} every {:?}", path, period);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        metrics::collect_dynamic_metrics(&orchestrator);
                        if let Err(e) = metrics::write_textfile(&path).await {
                            warn!("Failed to write metrics to {:?}: {}", path, e);
                        }
                    }
                }
            }
        })
    });

    info!("upflow {} running", VERSION);
    shutdown_signal().await;

    // Stop scanning before stopping the orchestrator
    info!("Shutting down...");
    shutdown.cancel();
    let _ = scanner_handle.await;
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    info!("Stopping orchestrator...");
    orchestrator.stop().await;
    info!("Orchestrator stopped");

    // Emit ServiceStopped event
    audit_handle
        .emit(AuditEvent::ServiceStopped {
            reason: "graceful_shutdown".to_string(),
        })
        .await;

    // Drop all holders of AuditHandle so the writer's channel closes.
    drop(orchestrator);
    drop(audit_handle);

    // Wait for writer to finish processing remaining events
    if tokio::time::timeout(Duration::from_secs(5), writer_handle)
        .await
        .is_err()
    {
        warn!("Audit writer did not drain in time");
    } else {
        info!("Audit writer stopped");
    }

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
