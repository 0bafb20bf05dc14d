//! Weights Manager - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use weights_manager::{
    Catalog, DownloadSettings, Orchestrator, OrchestratorDeps, api, config::ManagerConfig, metrics,
};

#[derive(Parser, Debug)]
#[command(name = "weights-manager")]
#[command(about = "Model weight download orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Catalog file, tried before the configured search path
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Override API port
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    tracing::info!("Starting Weights Manager");

    // Load configuration
    let mut config = ManagerConfig::load(cli.config)?;

    // CLI overrides
    if let Some(port) = cli.port {
        config.api_port = port;
    }
    if let Some(catalog) = cli.catalog {
        config.catalog_paths.insert(0, catalog);
    }

    config.validate()?;

    tracing::info!(
        api_port = config.api_port,
        max_retries = config.max_retries,
        poll_interval_ms = config.poll_interval_ms,
        wget = %config.tools.wget,
        curl = %config.tools.curl,
        "Configuration loaded"
    );

    // Load catalog
    let (catalog, catalog_path) = Catalog::load_from_search_path(&config.catalog_paths)
        .context("Failed to load artifact catalog")?;
    catalog
        .ensure_dirs()
        .context("Failed to create download directories")?;

    tracing::info!(
        path = ?catalog_path,
        artifacts = catalog.len(),
        download_path = ?catalog.settings().download_path,
        temp_path = ?catalog.settings().temp_path,
        "Catalog ready"
    );

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    let deps = OrchestratorDeps::system(&config)?;
    let orchestrator = Orchestrator::new(catalog, DownloadSettings::from(&config), deps);

    // Setup API
    let app_state = api::AppState {
        orchestrator: orchestrator.clone(),
        prometheus_handle,
    };

    let app = api::create_router(app_state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind API server")?;

    // Graceful shutdown: live download streams only end once their sessions
    // are cancelled, so cancel them before the server drains connections
    let shutdown_orchestrator = orchestrator.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutting down...");
            let cancelled = shutdown_orchestrator.cancel_all().await;
            if cancelled > 0 {
                tracing::info!(cancelled, "Cancelled in-flight downloads");
            }
        })
        .await
        .context("API server error")?;

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
