//! neurodx-worker - MRI diagnosis worker
//!
//! Consumes scan tasks from Redis, downloads volumes from MinIO, classifies
//! them into CN / MCI / AD, uploads a localization overlay and records the
//! outcome in PostgreSQL.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

use neurodx_common::config::{resolve_config_path, WorkerConfig};
use neurodx_worker::db::{self, PgTaskStore};
use neurodx_worker::model::BurnClassifier;
use neurodx_worker::services::{RedisTaskQueue, S3ObjectStore};
use neurodx_worker::{DiagnosticPipeline, PipelineSettings, TaskOrchestrator, WorkDirs};

#[derive(Parser, Debug)]
#[command(name = "neurodx-worker")]
#[command(about = "MRI diagnosis worker for NeuroDx")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "NEURODX_CONFIG")]
    config: Option<PathBuf>,

    /// Classifier weights (overrides the configured path)
    #[arg(long)]
    model_weights: Option<PathBuf>,
}

/// Level used until the configuration has been read
const STARTUP_LOG_LEVEL: &str = "info";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing before anything logs; the configured level is
    // applied once the configuration is loaded
    let startup_level = std::env::var("NEURODX_LOG_LEVEL").unwrap_or_else(|_| STARTUP_LOG_LEVEL.to_string());
    let (filter, filter_handle) = reload::Layer::new(log_filter(&startup_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = WorkerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(weights) = args.model_weights {
        config.model.weights_path = weights;
    }
    if config.logging.level != startup_level {
        if let Err(e) = filter_handle.reload(log_filter(&config.logging.level)) {
            warn!("Failed to apply log level {}: {}", config.logging.level, e);
        }
    }

    info!("Starting neurodx-worker v{}", env!("CARGO_PKG_VERSION"));
    match resolve_config_path(args.config.as_deref()) {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults and environment"),
    }

    let dirs = WorkDirs::from(&config.paths);
    dirs.create_all().context("Failed to create working directories")?;
    info!(
        scan_dir = %dirs.scan_dir.display(),
        artifact_dir = %dirs.artifact_dir.display(),
        "Working directories ready"
    );

    let classifier = tokio::task::spawn_blocking({
        let weights = config.model.weights_path.clone();
        let model_config = config.model.config_path.clone();
        move || BurnClassifier::load(&weights, model_config.as_deref())
    })
    .await
    .context("Classifier loading was interrupted")?
    .context("Failed to load classifier")?;
    let settings = PipelineSettings::from(&config.pipeline);
    info!(
        slices = settings.num_slices,
        target_layer = %settings.localization.target_layer,
        "Pipeline configured"
    );
    let analyzer = Arc::new(DiagnosticPipeline::new(Arc::new(classifier), settings));

    let pool = db::connect(&config.postgres)
        .await
        .context("Failed to connect to PostgreSQL")?;
    let queue = RedisTaskQueue::connect(&config.redis)
        .await
        .context("Failed to connect to Redis")?;
    let objects = S3ObjectStore::new(&config.storage).context("Failed to configure object storage")?;

    let orchestrator = TaskOrchestrator::new(
        Arc::new(queue),
        Arc::new(objects),
        Arc::new(PgTaskStore::new(pool.clone())),
        analyzer,
        dirs,
    )
    .with_reconnect_delay(std::time::Duration::from_millis(config.redis.reconnect_delay_ms));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let stats = orchestrator.run(cancel).await;
    info!(
        received = stats.received,
        done = stats.done,
        failed = stats.failed,
        "Shutdown complete"
    );

    pool.close().await;
    Ok(())
}

/// `RUST_LOG` when set, otherwise `level` for the worker's own crates
fn log_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(crate_directives(level)))
}

fn crate_directives(level: &str) -> String {
    format!("neurodx_worker={level},neurodx_common={level}")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, finishing current task");
        },
        _ = terminate => {
            info!("Received terminate signal, finishing current task");
        },
    }
}
