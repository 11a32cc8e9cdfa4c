//! Bot fleet manager
//!
//! Single-binary service that:
//! 1. Loads the credential pool and worker records from its state file
//! 2. Resumes workers that were running at the last exit
//! 3. Fails workers over to fresh credentials when the platform revokes them
//! 4. Serves the admin API and Prometheus metrics

mod admin;
mod config;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet::{AdminNotifier, FleetManager, LogNotifier, MessengerAdminNotifier};
use fleet_store::FleetStore;
use messenger::{TelegramClient, TelegramFactory};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::AdminState;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filtered by LOG_LEVEL or RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting fleet-manager");

    // Install before any worker can emit metrics
    let prometheus_handle = metrics::install_recorder()?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.admin.listen_addr,
        store = %config.store.path.display(),
        api_url = %config.platform.api_url,
        admins = config.notify.admin_ids.len(),
        "configuration loaded"
    );

    let store = FleetStore::load(config.store.path.clone())
        .await
        .with_context(|| format!("failed to load state from {}", config.store.path.display()))?;
    let store = Arc::new(store);

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.platform.request_timeout_secs))
        .build()
        .context("failed to build HTTP client")?;
    let factory = Arc::new(TelegramFactory::new(
        http.clone(),
        config.platform.api_url.clone(),
    ));

    let notifier: Arc<dyn AdminNotifier> = match &config.notify.token {
        Some(token) if !config.notify.admin_ids.is_empty() => {
            let client = TelegramClient::new(http, config.platform.api_url.clone(), token.clone());
            Arc::new(MessengerAdminNotifier::new(
                Arc::new(client),
                config.notify.admin_ids.clone(),
            ))
        }
        _ => {
            warn!("no notifier token or admin ids configured, admin notices go to the log only");
            Arc::new(LogNotifier)
        }
    };

    let (manager, events) = FleetManager::new(store, factory, notifier, config.fleet_settings());
    let supervisor = manager.spawn_supervisor(events);

    let resumed = manager.reconcile().await;
    if !resumed.failed.is_empty() {
        warn!(
            resumed = resumed.succeeded.len(),
            failed = resumed.failed.len(),
            "some workers could not be resumed"
        );
    }

    let app = admin::build_router(
        AdminState::new(manager.clone(), prometheus_handle),
        config.admin.max_connections,
    );

    let listen_addr = config.admin.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "admin API listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // Stop taking admin requests before workers go down
    let _ = shutdown_tx.send(());
    match server_handle.await {
        Ok(Ok(())) => info!("admin API drained"),
        Ok(Err(e)) => error!(error = %e, "admin server error during shutdown"),
        Err(e) => error!(error = %e, "admin server task panicked"),
    }

    // Workers keep is_running so the next start resumes them
    manager.shutdown().await;
    supervisor.abort();

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
