//! Handler-level API behavior: validation codes, projections, idempotent
//! session runs, and the status surface.

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;
use std::time::Duration;

use foresight_backend::api::{routes, AppState};
use foresight_backend::llm::{LlmError, LlmProvider, LlmRaw, LlmRequest, StructuredLlm};
use foresight_backend::market::MatchingEngine;
use foresight_backend::models::{Config, SessionStatus};
use foresight_backend::pipeline::Orchestrator;
use foresight_backend::sim::{RoundScheduler, SimPhase, SyntheticFeed, SyntheticSentiment};
use foresight_backend::store::{Broadcaster, Store};

/// Provider that never answers; keeps pipeline sessions alive while the
/// handlers under test run.
struct StallProvider;

#[async_trait]
impl LlmProvider for StallProvider {
    async fn complete(&self, _req: &LlmRequest) -> Result<LlmRaw, LlmError> {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Err(LlmError::Timeout)
    }
}

fn test_config() -> Config {
    Config {
        database_path: ":memory:".to_string(),
        port: 0,
        llm_api_key: "test-key".to_string(),
        llm_base_url: "http://localhost:0".to_string(),
        llm_model: "test-model".to_string(),
        agent_timeout_seconds: 30,
        trading_interval_seconds: 1,
        llm_max_retries: 0,
    }
}

fn app_state() -> AppState {
    let store = Store::in_memory().unwrap();
    let broadcaster = Broadcaster::new();
    let engine = MatchingEngine::new(store.clone(), broadcaster.clone());
    let scheduler = RoundScheduler::new(
        store.clone(),
        broadcaster.clone(),
        engine.clone(),
        Arc::new(SyntheticSentiment::new(1)),
        Arc::new(SyntheticFeed::new(1)),
    );
    let orchestrator = Orchestrator::new(
        store.clone(),
        broadcaster.clone(),
        StructuredLlm::new(Arc::new(StallProvider)),
    );
    AppState {
        store,
        broadcaster,
        engine,
        scheduler,
        orchestrator,
        config: test_config(),
        prometheus: None,
    }
}

fn forecast_request(question: &str) -> routes::CreateForecastRequest {
    routes::CreateForecastRequest {
        question_text: question.to_string(),
        question_type: None,
        agent_counts: None,
        forecaster_class: None,
        run_all_forecasters: false,
    }
}

#[tokio::test]
async fn health_reports_healthy() {
    let Json(body) = routes::health().await;
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn post_forecast_validates_input() {
    let state = app_state();

    let empty = routes::post_forecast(
        State(state.clone()),
        Json(forecast_request("   ")),
    )
    .await;
    assert_eq!(empty.err(), Some(StatusCode::BAD_REQUEST));

    let mut bad_type = forecast_request("Will X happen?");
    bad_type.question_type = Some("essay".to_string());
    let result = routes::post_forecast(State(state.clone()), Json(bad_type)).await;
    assert_eq!(result.err(), Some(StatusCode::BAD_REQUEST));

    let mut bad_class = forecast_request("Will X happen?");
    bad_class.forecaster_class = Some("bold".to_string());
    let result = routes::post_forecast(State(state.clone()), Json(bad_class)).await;
    assert_eq!(result.err(), Some(StatusCode::BAD_REQUEST));

    let mut bad_counts = forecast_request("Will X happen?");
    bad_counts.agent_counts = Some(foresight_backend::models::AgentCounts {
        phase_2_validation: Some(7),
        ..Default::default()
    });
    let result = routes::post_forecast(State(state), Json(bad_counts)).await;
    assert_eq!(result.err(), Some(StatusCode::BAD_REQUEST));
}

#[tokio::test]
async fn forecast_detail_projects_session() {
    let state = app_state();
    let Json(created) = routes::post_forecast(
        State(state.clone()),
        Json(forecast_request("Will X happen?")),
    )
    .await
    .unwrap();
    assert_eq!(created.status, SessionStatus::Running);

    let Json(detail) = routes::get_forecast(State(state.clone()), Path(created.id.clone()))
        .await
        .unwrap();
    assert_eq!(detail.session.id, created.id);
    assert_eq!(detail.session.question_text, "Will X happen?");
    assert!(detail.failed_phase.is_none());

    let missing = routes::get_forecast(State(state), Path("nope".to_string())).await;
    assert_eq!(missing.err(), Some(StatusCode::NOT_FOUND));
}

#[tokio::test]
async fn list_forecasts_pages_and_filters() {
    let state = app_state();
    for question in ["alpha question", "beta question", "alpha followup"] {
        routes::post_forecast(State(state.clone()), Json(forecast_request(question)))
            .await
            .unwrap();
    }

    let Json(all) = routes::list_forecasts(
        Query(routes::ListForecastsQuery {
            limit: None,
            offset: None,
            question_text: None,
        }),
        State(state.clone()),
    )
    .await
    .unwrap();
    assert_eq!(all.total, 3);
    assert_eq!(all.forecasts.len(), 3);

    let Json(filtered) = routes::list_forecasts(
        Query(routes::ListForecastsQuery {
            limit: Some(10),
            offset: None,
            question_text: Some("alpha".to_string()),
        }),
        State(state),
    )
    .await
    .unwrap();
    assert_eq!(filtered.total, 2);
}

#[tokio::test]
async fn session_run_is_idempotent_in_window() {
    let state = app_state();
    let request = || routes::RunSessionRequest {
        forecast: forecast_request("Will the market move?"),
        trading_interval_seconds: Some(1),
    };

    let Json(first) = routes::post_session_run(State(state.clone()), Json(request()))
        .await
        .unwrap();
    let Json(second) = routes::post_session_run(State(state.clone()), Json(request()))
        .await
        .unwrap();
    assert_eq!(first.session_id, second.session_id);

    // The registered simulation reports initializing while the pipeline
    // is still working.
    let Json(status) = routes::get_session_status(
        State(state),
        Path(first.session_id.clone()),
    )
    .await
    .unwrap();
    assert!(!status.running);
    assert_eq!(status.phase, SimPhase::Initializing);
}

#[tokio::test]
async fn status_and_orderbook_for_unknown_session_404() {
    let state = app_state();
    let status = routes::get_session_status(State(state.clone()), Path("ghost".to_string())).await;
    assert_eq!(status.err(), Some(StatusCode::NOT_FOUND));

    let book = routes::get_orderbook(State(state.clone()), Path("ghost".to_string())).await;
    assert_eq!(book.err(), Some(StatusCode::NOT_FOUND));

    let stop = routes::post_session_stop(State(state), Path("ghost".to_string())).await;
    assert_eq!(stop.err(), Some(StatusCode::NOT_FOUND));
}

#[tokio::test]
async fn pipeline_only_session_reports_stopped_status() {
    let state = app_state();
    let Json(created) = routes::post_forecast(
        State(state.clone()),
        Json(forecast_request("Quiet session")),
    )
    .await
    .unwrap();

    let Json(status) = routes::get_session_status(State(state.clone()), Path(created.id.clone()))
        .await
        .unwrap();
    assert!(!status.running);
    assert_eq!(status.phase, SimPhase::Stopped);
    assert_eq!(status.round_number, 0);

    let Json(book) = routes::get_orderbook(State(state), Path(created.id))
        .await
        .unwrap();
    assert!(book.bids.is_empty() && book.asks.is_empty());
    assert_eq!(book.volume, 0);
}

#[tokio::test]
async fn complete_marks_session_terminal() {
    let state = app_state();
    let Json(created) = routes::post_forecast(
        State(state.clone()),
        Json(forecast_request("Complete me")),
    )
    .await
    .unwrap();

    let Json(body) =
        routes::post_session_complete(State(state.clone()), Path(created.id.clone()))
            .await
            .unwrap();
    assert_eq!(body["completed"], true);

    let session = state.store.get_session(&created.id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
}
