//! Foresight: LLM-driven forecasting pipeline with a prediction-market
//! trading simulation on top.

use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use foresight_backend::api::{self, AppState};
use foresight_backend::llm::{HttpLlmClient, StructuredLlm};
use foresight_backend::market::MatchingEngine;
use foresight_backend::models::Config;
use foresight_backend::pipeline::Orchestrator;
use foresight_backend::sim::{RoundScheduler, SyntheticFeed, SyntheticSentiment};
use foresight_backend::store::{Broadcaster, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_env();
    init_tracing();

    info!("🔮 Foresight backend starting");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Fatal configuration error: {e}");
            std::process::exit(1);
        }
    };

    let store = match Store::new(&config.database_path) {
        Ok(store) => store,
        Err(e) => {
            error!("Unrecoverable store error at {}: {e}", config.database_path);
            std::process::exit(2);
        }
    };
    info!("📊 Store initialized at: {}", config.database_path);

    let prometheus = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Metrics recorder unavailable: {e}");
            None
        }
    };

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {e}"))?;

    let broadcaster = Broadcaster::new();
    let llm = StructuredLlm::new(Arc::new(HttpLlmClient::new(http_client, &config)));
    let orchestrator = Orchestrator::new(store.clone(), broadcaster.clone(), llm);
    let engine = MatchingEngine::new(store.clone(), broadcaster.clone());
    let scheduler = RoundScheduler::new(
        store.clone(),
        broadcaster.clone(),
        engine.clone(),
        Arc::new(SyntheticSentiment::new(42)),
        Arc::new(SyntheticFeed::new(42)),
    );

    let state = AppState {
        store,
        broadcaster,
        engine,
        scheduler,
        orchestrator,
        config: config.clone(),
        prometheus,
    };
    let app = api::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {addr}: {e}"))?;
    info!("🚀 Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("👋 Shutdown complete");
    Ok(())
}

fn load_env() {
    dotenv::dotenv().ok();
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
    }
}
