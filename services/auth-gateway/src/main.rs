// Titan Auth Gateway
// Registration, login and session routes in front of the security core

use anyhow::Context;
use auth_gateway::{
    build_router,
    config::GatewayConfig,
    database::{self, PgStore},
    store::{CredentialStore, InMemoryStore},
    AppState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_line_number(true)
            .init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting Titan Auth Gateway");

    let config = GatewayConfig::from_env().context("Failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let keys = config.security.resolve_keys()?;
    if keys.insecure {
        warn!("Running with development key material. NOT FOR PRODUCTION");
    }

    let (store, pool) = match &config.database.url {
        Some(url) => {
            let pg = PgStore::connect(&config.database, url).await?;
            let pool = pg.pool().clone();
            (Arc::new(pg) as Arc<dyn CredentialStore>, Some(pool))
        }
        None => {
            warn!("No DATABASE_URL configured, accounts are kept in memory");
            (Arc::new(InMemoryStore::new()) as Arc<dyn CredentialStore>, None)
        }
    };

    let audit_sink = database::audit_sink(&config, pool.as_ref())?;
    let state = AppState::new(&config.security, &keys, store, audit_sink)?;

    let cleanup = state
        .limiter
        .clone()
        .start_cleanup_task(Duration::from_secs(config.server.limiter_cleanup_secs));

    let origins = config
        .cors
        .header_values()
        .map_err(|e| anyhow::anyhow!(e))?;
    let app = build_router(state.clone(), origins);

    let bind_addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Auth gateway listening on: {}", bind_addr);
    info!("   POST /api/auth/register - Register company and admin");
    info!("   POST /api/auth/login - Login (rate limited)");
    info!("   GET  /api/auth/session - Current session");
    info!("   GET  /api/billing/status - Tenant billing status");
    info!("   GET  /health - Health check");
    info!("   GET  /metrics - Prometheus metrics");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    cleanup.abort();
    state.audit.shutdown().await;
    info!("Auth gateway stopped");

    Ok(())
}
