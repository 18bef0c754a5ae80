//! Main Entrypoint for the Live Bridge API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Building the Gemini connector and the session supervisor.
//! 3. Constructing the Axum router and applying middleware.
//! 4. Starting the web server and closing live sessions on shutdown.

use anyhow::Context;
use gemini_realtime::GeminiConnector;
use live_bridge_api::{config::Config, router::create_router, state::AppState};
use live_bridge_core::Supervisor;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!(?config, "Configuration loaded. Initializing application state...");

    // --- 3. Initialize the Upstream Connector and Supervisor ---
    let mut connector = GeminiConnector::new(config.gemini_api_key.clone());
    if let Some(url) = &config.gemini_ws_url {
        info!(url = %url, "Using custom Gemini Live endpoint");
        connector = connector.with_base_url(url.clone());
    }
    let supervisor = Arc::new(Supervisor::new(
        Arc::new(connector),
        config.translator_defaults(),
        config.session_policy(),
    ));

    let app_state = Arc::new(AppState {
        supervisor: supervisor.clone(),
        config: Arc::new(config.clone()),
        started_at: chrono::Utc::now(),
    });

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        model = %config.live_model,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        supervisor.shutdown().await;
    })
    .await?;

    info!("Server has shut down.");
    Ok(())
}
