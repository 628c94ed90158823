mod bootstrap;
mod health;
mod webhook;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use bookline_core::config::{AppConfig, LoadOptions};

fn init_logging(config: &AppConfig) {
    use bookline_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    // Now bootstrap using the same config we already loaded
    let app = bootstrap::bootstrap_with_config(config).await?;

    let sweep = tokio::spawn(Arc::clone(&app.reconciler).run_sweep(
        app.config.calendar.specialists.clone(),
        Duration::from_secs(app.config.calendar.reconcile_interval_secs),
        app.config.calendar.reconcile_horizon_days,
    ));
    tracing::info!(
        event_name = "system.server.sweep_started",
        interval_secs = app.config.calendar.reconcile_interval_secs,
        horizon_days = app.config.calendar.reconcile_horizon_days,
        "mirror reconciliation sweep started"
    );

    let router = health::router(app.db_pool.clone()).merge(webhook::router(Arc::clone(&app.driver)));
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        bind_address = %address,
        "bookline-server listening"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
    });
    let server = tokio::spawn(async move { serve.await });

    wait_for_shutdown().await?;
    tracing::info!(event_name = "system.server.stopping", "bookline-server stopping");
    let _ = shutdown_tx.send(());
    server.await??;
    sweep.abort();

    // Give in-flight mirror writes a bounded window to land before the pool
    // goes away.
    let drain = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    let _ = tokio::time::timeout(drain, app.db_pool.close()).await;

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
