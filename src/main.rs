//! # Avatar Relay - Main Application Entry Point
//!
//! Real-time relay between websocket clients and a speech-driven avatar
//! engine: clients stream microphone audio in and get synchronized video
//! frames and synthesized audio back.
//!
//! ## Application Architecture:
//! - **config**: application configuration (TOML files + environment variables)
//! - **error**: error types and HTTP error responses
//! - **media**: audio chunk and video frame value types
//! - **protocol**: binary wire codec and JSON control messages
//! - **engine**: the avatar engine contract and the built-in loopback engine
//! - **relay**: session registry, inbound queue, control plane and pumps
//! - **websocket**: one actor per connected client
//! - **state** / **health**: shared handler state and monitoring endpoints

mod config;
mod engine;
mod error;
mod health;
mod media;
mod protocol;
mod relay;
mod state;
mod websocket;

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use crate::config::AppConfig;
use crate::engine::{AvatarEngine, LoopbackEngine};
use crate::relay::Relay;
use crate::state::AppState;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Starts the engine and the relay pumps**; failure here is fatal
/// 4. **Serves** the websocket and health endpoints
/// 5. **Shuts down gracefully** on SIGINT/SIGTERM: relay first, then HTTP
#[actix_web::main]
async fn main() -> Result<()> {
    // .ok(): running without a .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load().context("failed to load configuration")?;
    config.validate()?;

    info!("Starting avatar-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let engine: Arc<dyn AvatarEngine> = Arc::new(LoopbackEngine::from_config(&config));
    let relay = Relay::start(config.clone(), engine)
        .await
        .context("failed to start avatar engine")?;

    let app_state = web::Data::new(AppState::new(config.clone(), Arc::clone(&relay)));
    let bind_addr = config.bind_addr();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(TracingLogger::default())
            .configure(routes)
    })
    // Shutdown is driven by shutdown_signal so the relay closes clients first
    .disable_signals()
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind {}", bind_addr))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
            relay.stop().await;
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping relay...");
            // Clients get a going-away close before the listener goes down
            relay.stop().await;
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Route table, shared with the end-to-end tests.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws", web::get().to(websocket::relay_websocket))
        .route("/", web::get().to(websocket::relay_websocket))
        .route("/health", web::get().to(health::health_check))
        .service(
            web::scope("/api/v1")
                .route("/health", web::get().to(health::health_check))
                .route("/stats", web::get().to(health::relay_stats)),
        );
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "avatar_relay=trace")
/// - If not set, defaults to "avatar_relay=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "avatar_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(())
}

/// Resolves on SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => {}
    }
}
