//! Main Entrypoint for the Patient Simulator API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Loading the scenario catalog.
//! 3. Initializing the Telnyx and OpenAI Realtime clients.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use openai_realtime::RealtimeConnector;
use patient_sim_api::{config::Config, router::create_router, state::AppState, telnyx::TelnyxClient};
use patient_sim_core::ScenarioCatalog;
use secrecy::{ExposeSecret, SecretString};
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
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Load Scenarios ---
    let catalog = match &config.scenarios_path {
        Some(path) => ScenarioCatalog::from_file(path)?,
        None => ScenarioCatalog::builtin()?,
    };
    info!(scenarios = catalog.len(), "Scenario catalog loaded.");

    // --- 4. Initialize Shared Services ---
    let telnyx = TelnyxClient::new(
        config.telnyx_api_base.clone(),
        SecretString::from(config.telnyx_api_key.expose_secret().to_string()),
    )
    .context("Failed to build Telnyx client")?;
    let connector = Arc::new(RealtimeConnector::new(
        SecretString::from(config.openai_api_key.expose_secret().to_string()),
        config.realtime_model.clone(),
    ));

    let bind_address = config.bind_address;
    info!(
        model = %config.realtime_model,
        voice = %config.realtime_voice,
        target = %config.target_number,
        webhook_url = %config.webhook_url(),
        stream_url = %config.stream_url(),
        transcripts = %config.transcripts_dir.display(),
        "Service configured."
    );
    let app_state = Arc::new(AppState::new(config, catalog, telnyx, connector));

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(%bind_address, "Starting server...");
    let listener = tokio::net::TcpListener::bind(bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
