use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use task_progress_server::api::{self, AppState};
use task_progress_server::{ProgressEngine, ServerConfig};

/// How long running tasks get to publish their cancellation on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting task progress server...");

    let config = ServerConfig::from_env().context("reading configuration")?;
    let engine = Arc::new(ProgressEngine::new(config.engine.clone()));
    let sweeper = engine.start_background();

    let app = api::router(AppState::new(Arc::clone(&engine)));

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("Server listening on {}", addr);

    let stop = engine.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = wait_for_shutdown_signal().await {
                tracing::error!("Failed to listen for shutdown signals: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Received shutdown signal, stopping...");
            // Open event streams never end on their own.
            stop.cancel();
        })
        .await
        .context("serving HTTP")?;

    engine.shutdown(SHUTDOWN_GRACE).await;
    if let Err(e) = sweeper.await {
        tracing::error!("Session sweeper ended abnormally: {}", e);
    }
    tracing::info!("Server stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
