mod error;
mod routes;
mod services;
mod state;

use crate::services::scan_scheduler::ScanScheduler;
use crate::state::AppState;
use clap::Parser;
use history_core::utils::logger;
use history_core::{HistoryEngine, Settings};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "history-server")]
#[command(about = "Keeps a rolling history of configuration files", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the settings file
    #[arg(short, long, default_value = "/data/settings.toml")]
    config: PathBuf,

    /// HTTP port (overrides settings and PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (overrides settings and LOG_LEVEL)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let mut settings = Settings::load(Some(&args.config))?;
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(level) = args.log_level {
        settings.log_level = level;
    }

    logger::init(&settings.log_level)?;
    tracing::info!("Starting configuration history on port {}", settings.port);

    let port = settings.port;
    let cron = settings.cron_expression().map(str::to_string);

    // Loads summaries and runs the startup scan
    let engine = HistoryEngine::start(settings).await?;
    let state = Arc::new(AppState::new(engine.clone()));
    let cancel = CancellationToken::new();

    // Periodic full scans
    let scheduler = match cron {
        Some(cron) => match ScanScheduler::new(engine.clone(), cancel.clone()).await {
            Ok(s) => {
                if let Err(e) = s.schedule_scan(&cron).await {
                    tracing::warn!(cron = %cron, "Failed to schedule scans: {}", e);
                }
                if let Err(e) = s.start().await {
                    tracing::warn!("Failed to start scheduler: {}", e);
                }
                Some(s)
            }
            Err(e) => {
                tracing::warn!("Failed to create scheduler: {}", e);
                None
            }
        },
        None => {
            tracing::info!("No cron schedule configured, periodic scans disabled");
            None
        }
    };

    let app = routes::create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    tracing::info!("Shutting down...");
    cancel.cancel();

    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }

    // Drains queued backups before exiting
    engine.shutdown().await;
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
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
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
}
