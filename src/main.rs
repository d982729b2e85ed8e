//! Gatekeeper service entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatekeeper::auth::ResetSettings;
use gatekeeper::config::GatekeeperConfig;
use gatekeeper::database::Database;
use gatekeeper::error::{GatekeeperError, Result};
use gatekeeper::notification::LogMailer;
use gatekeeper::password::PasswordManager;
use gatekeeper::seed::{bootstrap_admin, seed_catalog};
use gatekeeper::token::TokenIssuer;
use gatekeeper::web::{build_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    // RUST_LOG overrides the default level, e.g. RUST_LOG=gatekeeper=debug
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        build = env!("BUILD_TIMESTAMP"),
        "Gatekeeper starting..."
    );

    let config = GatekeeperConfig::from_env()?;
    tracing::info!(config = ?config, "Configuration loaded");

    let db = Arc::new(Database::new(&config.database_path).await?);
    tracing::info!(path = %config.database_path, "Database initialized");

    let tokens = Arc::new(TokenIssuer::new(
        &config.jwt_secret,
        Duration::hours(config.token_ttl_hours),
    ));
    let passwords = Arc::new(PasswordManager::new());

    let state = AppState::assemble(
        db,
        tokens,
        passwords,
        Arc::new(LogMailer),
        ResetSettings {
            token_ttl: Duration::minutes(config.reset_token_ttl_minutes),
            app_base_url: config.app_base_url.clone(),
        },
        config.static_dir.clone(),
    )?;

    seed_catalog(&state.catalog).await?;

    if let Some(admin) = &config.bootstrap_admin {
        let user_id = bootstrap_admin(
            &state.users,
            &state.rbac,
            &state.passwords,
            &state.validator,
            admin,
        )
        .await?;
        tracing::info!(user_id, "Bootstrap admin ready");
    }

    let router = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.web_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| GatekeeperError::Config(format!("Failed to bind {}: {}", addr, e)))?;
    tracing::info!(port = config.web_port, "Web server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| GatekeeperError::InternalState(format!("Web server error: {}", e)))?;

    tracing::info!("Gatekeeper stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}
