//! CloudFort Server
//!
//! Hands out exclusive, expiring leases on shared Dwarf Fortress worlds and
//! takes the changed worlds back.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cloudfort_server::audit::{HistoryLedger, HISTORY_FILE_NAME};
use cloudfort_server::config::{Config, DEFAULT_CONFIG_FILE};
use cloudfort_server::expiry::LeaseExpiryMonitor;
use cloudfort_server::locks::{FileTokenStore, LockManager};
use cloudfort_server::protocol::ProtocolEngine;
use cloudfort_server::server::serve;
use cloudfort_server::state::AppState;
use cloudfort_server::world::{RegexSaveFilter, WorldStore};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cloudfort_server=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!("Server failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config_path = std::env::var("CLOUDFORT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = Config::load_or_init(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?
        .with_env_overrides()?;
    config.validate()?;

    tracing::info!("Starting CloudFort Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("World save folder: {}", config.world_save_folder.display());

    for dir in [&config.world_save_folder, &config.temp_folder] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating folder {}", dir.display()))?;
    }

    let history = HistoryLedger::open(config.world_save_folder.join(HISTORY_FILE_NAME))
        .await
        .context("opening history ledger")?;
    let token_store = FileTokenStore::new(&config.world_save_folder);
    let worlds = WorldStore::new(
        &config.world_save_folder,
        &config.temp_folder,
        Arc::new(RegexSaveFilter::dwarf_fortress()),
    );

    let report = worlds
        .reconcile_on_startup(&token_store, &config.server_overseer_name)
        .await
        .context("reconciling world archives with lock records")?;
    for world in &report.initialized {
        history
            .record(world, &config.server_overseer_name, "World added to server")
            .await;
    }
    for world in &report.reset {
        history
            .record(world, &config.server_overseer_name, "Unreadable lock record reset")
            .await;
    }
    let locks = LockManager::new(token_store, report.tokens);
    let state = AppState::new(config.clone(), locks, worlds, history);

    let monitor = LeaseExpiryMonitor::new(state.clone()).start();

    let addr = config.bind_address();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    tracing::info!("CloudFort Server listening on {}", addr);

    serve(listener, ProtocolEngine::new(state), shutdown_signal()).await?;

    monitor.abort();
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
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
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
