//! Gateway entry point.
//!
//! Connects to the configuration database, loads the live service and
//! credential sets, and serves the ingress surface. Reconfiguration happens
//! through the management surface writing to the database; `SIGHUP`-free
//! deployments can rely on the periodic reload.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use llm_gateway::api::AppState;
use llm_gateway::core::{
    init_usage_recorder, shutdown_usage_recorder, ConfigSnapshot, Database, DatabaseConfig,
    GatewayConfig,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often the service/credential snapshot is refreshed from the database.
const CONFIG_RELOAD_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before reading any environment variables
    dotenvy::dotenv().ok();

    // Suppress noisy HTTP library logs regardless of RUST_LOG
    let base_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,llm_gateway=debug".to_string());
    let filter = tracing_subscriber::EnvFilter::new(format!(
        "{},hyper=warn,h2=warn,reqwest=warn",
        base_filter
    ));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let db_url = std::env::var("DB_URL")
        .map_err(|_| anyhow::anyhow!("DB_URL environment variable is required"))?;

    tracing::info!("Connecting to database...");
    let db = Database::connect(&DatabaseConfig::from_url(&db_url)).await?;
    if !db.check_migrations().await? {
        return Err(anyhow::anyhow!(
            "Database migrations not applied. Run the migration script first."
        ));
    }
    let db = Arc::new(db);

    init_usage_recorder(db.pool().clone());

    let snapshot = match db.load_snapshot().await {
        Ok(snapshot) => {
            tracing::info!(
                services = snapshot.services.len(),
                credentials = snapshot.credentials.len(),
                "Configuration loaded"
            );
            snapshot
        }
        Err(err) => {
            tracing::warn!("Starting with empty configuration: {}", err);
            ConfigSnapshot::default()
        }
    };

    let config = Arc::new(GatewayConfig::with_database(snapshot, db.clone()));

    // Periodic snapshot refresh; management-side writes become visible
    // within one interval.
    {
        let config = config.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(CONFIG_RELOAD_SECS));
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(err) = config.reload().await {
                    tracing::warn!("Config reload failed: {}", err);
                }
            }
        });
    }

    let state = Arc::new(AppState::new(config));
    let app = llm_gateway::build_router(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(1428);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!("LLM gateway listening on {}", addr);
    tracing::info!("OpenAI ingress: POST /v1/chat/completions, GET /v1/models");
    tracing::info!("Anthropic ingress: POST /v1/messages");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Flush any queued usage records before exit
    shutdown_usage_recorder().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
