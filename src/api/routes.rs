//! API handlers.
//!
//! Validation failures map to 400, unknown ids to 404, store faults to
//! 503. Session-level failure detail (which phase failed, which workers)
//! rides on the forecast detail payload.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::api::{spawn_forecast, spawn_full_session, AppState};
use crate::market::book;
use crate::models::{
    AgentCounts, AgentLogRow, FactorRow, ForecasterClass, ForecasterResponseRow, LiveEvent,
    QuestionType, SessionPhase, SessionRow, SessionStatus, TradeRow, TraderStateRow,
};
use crate::pipeline::PipelineConfig;
use crate::sim::SimStatus;

/// Window inside which a repeated run request returns the existing
/// active session instead of creating a new one.
const DEDUP_WINDOW_SECS: i64 = 600;

fn store_unavailable(e: anyhow::Error) -> StatusCode {
    warn!(error = %e, "Store unavailable");
    StatusCode::SERVICE_UNAVAILABLE
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy"}))
}

pub async fn get_metrics(State(state): State<AppState>) -> Result<String, StatusCode> {
    match &state.prometheus {
        Some(handle) => Ok(handle.render()),
        None => Err(StatusCode::NOT_FOUND),
    }
}

// ---------------------------------------------------------------------------
// Forecasts (pipeline-only sessions)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateForecastRequest {
    pub question_text: String,
    #[serde(default)]
    pub question_type: Option<String>,
    #[serde(default)]
    pub agent_counts: Option<AgentCounts>,
    #[serde(default)]
    pub forecaster_class: Option<String>,
    #[serde(default)]
    pub run_all_forecasters: bool,
}

struct ValidatedRequest {
    question_text: String,
    question_type: QuestionType,
    config_counts: crate::models::ResolvedCounts,
    classes: Vec<ForecasterClass>,
}

fn validate_forecast_request(req: &CreateForecastRequest) -> Result<ValidatedRequest, StatusCode> {
    let question_text = req.question_text.trim().to_string();
    if question_text.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let question_type = match req.question_type.as_deref() {
        None => QuestionType::Binary,
        Some(raw) => QuestionType::parse(raw).ok_or(StatusCode::BAD_REQUEST)?,
    };

    let config_counts = req
        .agent_counts
        .clone()
        .unwrap_or_default()
        .resolve()
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let classes = if req.run_all_forecasters {
        ForecasterClass::ALL.to_vec()
    } else {
        match req.forecaster_class.as_deref() {
            None => vec![ForecasterClass::Balanced],
            Some(raw) => vec![ForecasterClass::parse(raw).ok_or(StatusCode::BAD_REQUEST)?],
        }
    };

    Ok(ValidatedRequest {
        question_text,
        question_type,
        config_counts,
        classes,
    })
}

fn pipeline_config(state: &AppState, validated: &ValidatedRequest) -> PipelineConfig {
    let mut config = PipelineConfig::new(validated.config_counts, validated.classes.clone());
    config.worker_timeout = Duration::from_secs(state.config.agent_timeout_seconds);
    config.max_retries = state.config.llm_max_retries;
    config
}

async fn insert_new_session(
    state: &AppState,
    question_text: String,
    question_type: QuestionType,
) -> Result<SessionRow, StatusCode> {
    let row = SessionRow {
        id: Uuid::new_v4().to_string(),
        question_text,
        question_type,
        status: SessionStatus::Running,
        current_phase: SessionPhase::Created,
        tokens_used: 0,
        error_message: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    };
    state
        .store
        .insert_session(&row)
        .await
        .map_err(store_unavailable)?;
    state.broadcaster.publish(LiveEvent::Sessions(row.clone()));
    Ok(row)
}

pub async fn post_forecast(
    State(state): State<AppState>,
    Json(req): Json<CreateForecastRequest>,
) -> Result<Json<SessionRow>, StatusCode> {
    let validated = validate_forecast_request(&req)?;
    let config = pipeline_config(&state, &validated);

    let row = insert_new_session(&state, validated.question_text, validated.question_type).await?;
    spawn_forecast(state, row.id.clone(), config);
    Ok(Json(row))
}

#[derive(Debug, Serialize)]
pub struct ForecastDetail {
    #[serde(flatten)]
    pub session: SessionRow,
    pub forecaster_responses: Vec<ForecasterResponseRow>,
    pub factors: Vec<FactorRow>,
    pub agent_logs: Vec<AgentLogRow>,
    /// Present only on failed sessions: the phase that failed and the
    /// worker logs that failed in it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_agent_logs: Vec<AgentLogRow>,
}

pub async fn get_forecast(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ForecastDetail>, StatusCode> {
    let session = state
        .store
        .get_session(&id)
        .await
        .map_err(store_unavailable)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let forecaster_responses = state
        .store
        .list_forecaster_responses(&id)
        .await
        .map_err(store_unavailable)?;
    let factors = state.store.list_factors(&id).await.map_err(store_unavailable)?;
    let agent_logs = state
        .store
        .list_agent_logs(&id)
        .await
        .map_err(store_unavailable)?;

    let (failed_phase, failed_agent_logs) = if session.status == SessionStatus::Failed {
        (
            Some(session.current_phase.as_str().to_string()),
            agent_logs
                .iter()
                .filter(|l| l.status == crate::models::WorkerStatus::Failed)
                .cloned()
                .collect(),
        )
    } else {
        (None, Vec::new())
    };

    Ok(Json(ForecastDetail {
        session,
        forecaster_responses,
        factors,
        agent_logs,
        failed_phase,
        failed_agent_logs,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListForecastsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub question_text: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListForecastsResponse {
    pub forecasts: Vec<SessionRow>,
    pub total: i64,
}

pub async fn list_forecasts(
    Query(params): Query<ListForecastsQuery>,
    State(state): State<AppState>,
) -> Result<Json<ListForecastsResponse>, StatusCode> {
    let limit = params.limit.unwrap_or(20).min(200);
    let offset = params.offset.unwrap_or(0);
    let (forecasts, total) = state
        .store
        .list_sessions(limit, offset, params.question_text.as_deref())
        .await
        .map_err(store_unavailable)?;
    Ok(Json(ListForecastsResponse { forecasts, total }))
}

// ---------------------------------------------------------------------------
// Sessions (pipeline + trading simulation)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RunSessionRequest {
    #[serde(flatten)]
    pub forecast: CreateForecastRequest,
    #[serde(default)]
    pub trading_interval_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RunSessionResponse {
    pub session_id: String,
}

pub async fn post_session_run(
    State(state): State<AppState>,
    Json(req): Json<RunSessionRequest>,
) -> Result<Json<RunSessionResponse>, StatusCode> {
    let validated = validate_forecast_request(&req.forecast)?;
    if matches!(req.trading_interval_seconds, Some(0)) {
        return Err(StatusCode::BAD_REQUEST);
    }

    // Server-side idempotency: an equivalent active session inside the
    // window is returned as-is rather than double-started.
    if let Some(existing) = state
        .store
        .find_recent_active_session(&validated.question_text, DEDUP_WINDOW_SECS)
        .await
        .map_err(store_unavailable)?
    {
        return Ok(Json(RunSessionResponse {
            session_id: existing,
        }));
    }

    let mut config = pipeline_config(&state, &validated);
    config.finalize_session = false;
    let interval = Duration::from_secs(
        req.trading_interval_seconds
            .unwrap_or(state.config.trading_interval_seconds),
    );

    let row = insert_new_session(&state, validated.question_text, validated.question_type).await?;
    let session_id = row.id.clone();
    spawn_full_session(state, session_id.clone(), config, interval);
    Ok(Json(RunSessionResponse { session_id }))
}

pub async fn get_session_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SimStatus>, StatusCode> {
    if let Some(status) = state.scheduler.status(&id) {
        return Ok(Json(status));
    }
    // Known session with no simulation attached reports as stopped.
    let exists = state
        .store
        .get_session(&id)
        .await
        .map_err(store_unavailable)?
        .is_some();
    if exists {
        Ok(Json(SimStatus {
            running: false,
            phase: crate::sim::SimPhase::Stopped,
            round_number: 0,
        }))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

pub async fn post_session_stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let exists = state
        .store
        .get_session(&id)
        .await
        .map_err(store_unavailable)?
        .is_some();
    if !exists {
        return Err(StatusCode::NOT_FOUND);
    }
    state.scheduler.stop(&id);
    Ok(Json(serde_json::json!({"stopped": true})))
}

pub async fn post_session_complete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let session = state
        .store
        .get_session(&id)
        .await
        .map_err(store_unavailable)?
        .ok_or(StatusCode::NOT_FOUND)?;

    if !state.scheduler.complete(&id) && !session.status.is_terminal() {
        // No simulation loop to do it; mark the session terminal here.
        state
            .store
            .set_session_status(&id, SessionStatus::Completed, None)
            .await
            .map_err(store_unavailable)?;
        if let Ok(Some(row)) = state.store.get_session(&id).await {
            state.broadcaster.publish(LiveEvent::Sessions(row));
        }
    }
    Ok(Json(serde_json::json!({"completed": true})))
}

pub async fn get_orderbook(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<book::OrderbookSnapshot>, StatusCode> {
    let exists = state
        .store
        .get_session(&id)
        .await
        .map_err(store_unavailable)?
        .is_some();
    if !exists {
        return Err(StatusCode::NOT_FOUND);
    }
    let snapshot = book::orderbook_snapshot(&state.store, &id)
        .await
        .map_err(store_unavailable)?;
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
pub struct TradesQuery {
    pub limit: Option<usize>,
}

pub async fn get_session_trades(
    Query(params): Query<TradesQuery>,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TradeRow>>, StatusCode> {
    let exists = state
        .store
        .get_session(&id)
        .await
        .map_err(store_unavailable)?
        .is_some();
    if !exists {
        return Err(StatusCode::NOT_FOUND);
    }
    let trades = state
        .store
        .list_trades(&id, params.limit.unwrap_or(100).min(1000))
        .await
        .map_err(store_unavailable)?;
    Ok(Json(trades))
}

#[derive(Debug, Serialize)]
pub struct TraderView {
    #[serde(flatten)]
    pub state: TraderStateRow,
    /// Position marked to the last trade price.
    pub mark_to_market: f64,
}

pub async fn get_session_traders(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TraderView>>, StatusCode> {
    let exists = state
        .store
        .get_session(&id)
        .await
        .map_err(store_unavailable)?
        .is_some();
    if !exists {
        return Err(StatusCode::NOT_FOUND);
    }
    let (last_price, _) = state.store.trade_stats(&id).await.map_err(store_unavailable)?;
    let mark = last_price.unwrap_or(50) as f64 / 100.0;
    let traders = state
        .store
        .list_trader_states(&id)
        .await
        .map_err(store_unavailable)?
        .into_iter()
        .map(|s| {
            let mark_to_market = s.cash + s.position as f64 * mark;
            TraderView {
                state: s,
                mark_to_market,
            }
        })
        .collect();
    Ok(Json(traders))
}
