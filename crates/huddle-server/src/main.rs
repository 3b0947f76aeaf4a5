//! huddle-server - Live collaboration backend server
//!
//! REST API and SSE streaming over collaboration sessions.

use huddle_core::auth::ServiceToken;
use huddle_core::engine::GroqClient;
use huddle_core::Database;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod error;
mod middleware;
mod routes;
mod services;
mod state;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("huddle_server=info".parse()?))
        .init();

    info!("huddle-server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = config::Config::load()?;
    info!("Data directory: {:?}", config.huddle_dir);

    // Open the database (schema is initialized on open)
    let db = Database::open_path(&config.database_path)?;

    // Load the service token, generating one on first start
    let service_token = if config.service_token_file.exists() {
        ServiceToken::read_from_file(&config.service_token_file)?
    } else {
        let token = ServiceToken::generate();
        token.write_to_file(&config.service_token_file)?;
        info!("Service token written to {:?}", config.service_token_file);
        token
    };

    // Text-generation backend for the merge engine
    if config.groq_api_key.is_none() {
        warn!("GROQ_API_KEY is not set; merge applications will fail until it is provided");
    }
    let generator = Arc::new(GroqClient::new(
        config.groq_api_key.clone().unwrap_or_default(),
        config.groq_model.clone(),
        config.groq_base_url.clone(),
    ));

    let bind_addr = config.bind_addr;
    let state = state::AppState::new(config, db, service_token, generator);
    let router = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("Listening on {}", bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to install shutdown handler: {err}");
    }
}
