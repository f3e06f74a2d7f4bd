use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use slopebook::api::{self, AppState};
use slopebook::calendar::CalendarCache;
use slopebook::config::Config;
use slopebook::engine::{Collaborators, Engine};
use slopebook::notify::NotifyHub;
use slopebook::payment::LoggingGateway;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    slopebook::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let calendar = Arc::new(CalendarCache::new());
    let collaborators = Collaborators::new(calendar.clone(), Arc::new(LoggingGateway))
        .with_policy(config.policy());
    let engine = Arc::new(Engine::new(
        config.wal_path(),
        Arc::new(NotifyHub::new()),
        collaborators,
    )?);

    let state = AppState {
        engine,
        calendar,
        secrets: Arc::new(config.secrets.clone()),
        compact_threshold: config.compact_threshold,
    };

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("slopebook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!(
        "  hold window: {}m, acceptance window: {}h",
        config.hold_window_minutes, config.accept_window_hours
    );
    for (name, secret) in [
        ("cron", &config.secrets.cron),
        ("webhook", &config.secrets.webhook),
        ("sync", &config.secrets.sync),
    ] {
        if secret.is_none() {
            tracing::warn!("{name} endpoint disabled: no secret configured");
        }
    }

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("slopebook stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM; in-flight requests drain before serve returns.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("failed to register SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received");
}
