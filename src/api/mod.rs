//! HTTP surface: shared application state, the router, and the live
//! websocket feed.

pub mod routes;
pub mod ws;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::market::MatchingEngine;
use crate::models::Config;
use crate::pipeline::{Orchestrator, PipelineConfig};
use crate::sim::RoundScheduler;
use crate::store::{Broadcaster, Store};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub broadcaster: Broadcaster,
    pub engine: MatchingEngine,
    pub scheduler: RoundScheduler,
    pub orchestrator: Orchestrator,
    pub config: Config,
    pub prometheus: Option<PrometheusHandle>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/metrics", get(routes::get_metrics))
        .route(
            "/api/forecasts",
            post(routes::post_forecast).get(routes::list_forecasts),
        )
        .route("/api/forecasts/:id", get(routes::get_forecast))
        .route("/api/sessions/run", post(routes::post_session_run))
        .route("/api/sessions/:id/status", get(routes::get_session_status))
        .route("/api/sessions/:id/stop", post(routes::post_session_stop))
        .route(
            "/api/sessions/:id/complete",
            post(routes::post_session_complete),
        )
        .route("/api/sessions/:id/orderbook", get(routes::get_orderbook))
        .route("/api/sessions/:id/trades", get(routes::get_session_trades))
        .route("/api/sessions/:id/traders", get(routes::get_session_traders))
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the forecasting pipeline for a session in the background.
pub fn spawn_forecast(state: AppState, session_id: String, config: PipelineConfig) {
    tokio::spawn(async move {
        if let Err(e) = state.orchestrator.run(&session_id, &config).await {
            error!(session_id, error = %e, "Pipeline run aborted");
        }
    });
}

/// Run the pipeline and, on success, hand its seed probabilities to the
/// trading simulation. The scheduler entry is registered up front so the
/// status endpoint reports `initializing` while the pipeline runs.
pub fn spawn_full_session(
    state: AppState,
    session_id: String,
    config: PipelineConfig,
    interval: Duration,
) {
    state.scheduler.register(&session_id);
    tokio::spawn(async move {
        let seeds: HashMap<_, _> = match state.orchestrator.run(&session_id, &config).await {
            Ok(outcome) if outcome.status == crate::models::SessionStatus::Completed => {
                outcome.seeds
            }
            Ok(_) => {
                info!(session_id, "Pipeline failed, trading simulation skipped");
                state.scheduler.mark_stopped(&session_id);
                return;
            }
            Err(e) => {
                error!(session_id, error = %e, "Pipeline run aborted");
                state.scheduler.mark_stopped(&session_id);
                return;
            }
        };
        if let Err(e) = state
            .scheduler
            .run_session(&session_id, seeds, interval)
            .await
        {
            error!(session_id, error = %e, "Trading simulation aborted");
            state.scheduler.mark_stopped(&session_id);
        }
    });
}
