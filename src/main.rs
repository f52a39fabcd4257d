mod app_state;
mod cardgen;
mod config;
mod crypto;
mod db;
mod expiry;
mod handlers;
mod issuer;
mod ledger;
mod retry;
mod sweeper;

use clap::Parser;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use app_state::AppState;
use config::Config;
use db::init_pool;
use issuer::IssuerService;
use ledger::SqliteLedger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "card_issuer=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();

    // Key material first, so a misconfigured deployment fails before touching the database
    let hasher = config.pan_hasher()?;
    let cvv = config.cvv_provider()?;

    let pool = init_pool(&config.database_url, config.db_max_connections).await?;

    let issuer = Arc::new(IssuerService::new(
        Arc::new(SqliteLedger::new(pool, hasher)),
        cvv.clone(),
        config.expiry_calculator(),
        config.issuer_settings(),
    ));

    match config.sweep_interval() {
        Some(every) => {
            tokio::spawn(sweeper::run_hold_sweeper(issuer.clone(), every));
        }
        None => tracing::warn!("hold sweeper disabled"),
    }

    let app = handlers::router(AppState { issuer })
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let listener = tokio::net::TcpListener::bind(&config.socket_addr()).await?;

    tracing::info!("Server running on {}", config.socket_addr());
    tracing::info!(
        bin = %config.bin_prefix,
        product = %config.card_product,
        cvv_provider = cvv.name(),
        "issuer configured"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    Ok(())
}
