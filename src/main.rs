use classcode_backend::{
    config::Config,
    error::Result,
    routes,
    services::scheduler::SummaryScheduler,
    state::AppState,
};
use std::net::SocketAddr;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "classcode_backend=info,tower_http=info".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting Classcode Backend...");

    // Load configuration
    let config = Config::from_env()
        .map_err(|e| classcode_backend::error::AppError::Config(e.to_string()))?;

    info!("Configuration loaded");

    // Initialize application state
    let state = AppState::new(config)?;

    info!("Application state initialized");

    // Create router
    let app = routes::create_router(state.clone());

    // Build address
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.server.port));

    info!("Server listening on {}", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| classcode_backend::error::AppError::Internal(anyhow::anyhow!("Failed to bind: {}", e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .map_err(|e| classcode_backend::error::AppError::Internal(anyhow::anyhow!("Server error: {}", e)))?;

    Ok(())
}

async fn shutdown_signal(state: AppState) {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received, stopping schedulers");
    SummaryScheduler::stop_all(&state).await;
}
