use anyhow::{Context, Result};
use axum::{http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use keeper_server::config::Config;
use keeper_server::dispatcher::Dispatcher;
use keeper_server::github::GitHubClient;
use keeper_server::ledger::DeliveryLedger;
use keeper_server::locks::PrLocks;
use keeper_server::pipeline::Pipeline;
use keeper_server::retry::{RateBudget, RetryingApi};
use keeper_server::webhook::webhook_router;
use keeper_server::AppState;

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "keeper",
        "version": keeper_server::get_bot_version()
    })))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    info!(
        "Starting keeper {} on port {}",
        keeper_server::get_bot_version(),
        config.port
    );

    let budget = Arc::new(RateBudget::per_hour(config.rate_limit_per_hour));
    let github_client = GitHubClient::new(
        config.github_app_id,
        config.github_private_key.clone(),
        budget.clone(),
    )
    .context("Failed to create GitHub client")?;
    let api = RetryingApi::new(github_client, config.retry_policy(), budget);

    let pipeline = Pipeline::new(
        Arc::new(api),
        Arc::new(config.settings()),
        config.pipeline_options(),
    );
    let dispatcher = Dispatcher::new(
        Arc::new(pipeline),
        DeliveryLedger::new(100_000, config.delivery_ttl),
        PrLocks::new(),
    );

    let app_state = Arc::new(AppState {
        dispatcher: Arc::new(dispatcher),
        webhook_secret: config.github_webhook_secret.clone(),
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(webhook_router(app_state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
