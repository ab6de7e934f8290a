use clap::Parser;
use cloudvault::{router, AppState, Config};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cloudvault=info,server=info,tower_http=info")),
        )
        .init();

    let config = Config::parse();

    // Schema migration runs here, once, before the listener accepts traffic.
    let state = Arc::new(AppState::from_config(&config)?);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind).await?;

    tracing::info!(addr = %config.bind, "cloud storage backend listening");
    tracing::info!("endpoints: POST /auth/register, POST /auth/login, GET /search?q=, GET /search/history");
    tracing::info!("endpoints: POST /files/upload, GET /files/list, GET /files/download/:id, DELETE /files/delete/:id");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
