//! End-to-end pipeline scenarios driven through the orchestrator with
//! scripted LLM providers.

mod common;

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use foresight_backend::llm::{LlmError, LlmProvider, LlmRaw, LlmRequest, StructuredLlm};
use foresight_backend::models::{
    AgentCounts, ForecasterClass, SessionStatus, WorkerStatus,
};
use foresight_backend::pipeline::{Orchestrator, PipelineConfig};
use foresight_backend::store::{Broadcaster, Store};

fn ok_raw(content: serde_json::Value) -> Result<LlmRaw, LlmError> {
    Ok(LlmRaw {
        content: content.to_string(),
        prompt_tokens: 10,
        completion_tokens: 10,
        sources_count: 0,
    })
}

fn macro_factor() -> serde_json::Value {
    json!({
        "name": "Macroeconomic trend",
        "description": "Broad economic conditions shaping the outcome",
        "category": "economic"
    })
}

/// Answers every phase with the fixed fixture the scenario expects.
struct FixedProvider;

#[async_trait]
impl LlmProvider for FixedProvider {
    async fn complete(&self, req: &LlmRequest) -> Result<LlmRaw, LlmError> {
        match req.schema_name {
            "discovery_factors" | "validated_factors" => {
                ok_raw(json!({"factors": [macro_factor()]}))
            }
            "factor_ratings" => ok_raw(json!({
                "ratings": [{"name": "Macroeconomic trend", "score": 8.0}]
            })),
            "factor_research" => ok_raw(json!({
                "summary": "Comparable macro cycles resolved YES about 60% of the time."
            })),
            "forecast_synthesis" => ok_raw(json!({
                "prediction_probability": 0.62,
                "confidence": 0.7,
                "reasoning": "The macro trend dominates and favors YES.",
                "key_factors": ["Macroeconomic trend"]
            })),
            other => Err(LlmError::transport(format!("unexpected schema {other}"))),
        }
    }
}

fn config(counts: AgentCounts, classes: Vec<ForecasterClass>) -> PipelineConfig {
    PipelineConfig::new(counts.resolve().unwrap(), classes)
}

fn orchestrator(store: &Store, provider: Arc<dyn LlmProvider>) -> Orchestrator {
    Orchestrator::new(
        store.clone(),
        Broadcaster::new(),
        StructuredLlm::new(provider),
    )
}

/// Scenario: fixed mock responses converge to one balanced forecast.
#[tokio::test]
async fn synthesis_convergence_with_balanced_class() {
    let store = Store::in_memory().unwrap();
    let orchestrator = orchestrator(&store, Arc::new(FixedProvider));
    let session_id = common::insert_session(&store, "Will X happen by 2025?").await;

    let counts = AgentCounts {
        phase_1_discovery: Some(2),
        phase_2_validation: Some(2),
        phase_3_research: Some(2),
        ..Default::default()
    };
    let outcome = orchestrator
        .run(&session_id, &config(counts, vec![ForecasterClass::Balanced]))
        .await
        .unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);

    let responses = store.list_forecaster_responses(&session_id).await.unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].forecaster_class, ForecasterClass::Balanced);
    assert_eq!(responses[0].prediction_probability, Some(0.62));
    assert_eq!(responses[0].confidence, Some(0.7));
    assert_eq!(responses[0].status, WorkerStatus::Completed);
    assert!(responses[0].phase_durations.is_some());

    let session = store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);

    let logs = store.list_agent_logs(&session_id).await.unwrap();
    assert!(logs.len() >= 5, "expected >=5 agent logs, got {}", logs.len());
    assert!(logs.iter().all(|l| l.status == WorkerStatus::Completed));
    assert!(logs.iter().all(|l| l.completed_at.is_some()));
    assert!(logs.iter().all(|l| l.created_at <= l.completed_at.unwrap()));

    let factors = store.list_factors(&session_id).await.unwrap();
    assert_eq!(factors.len(), 1);
    assert_eq!(factors[0].importance_score, Some(8.0));
    assert!(factors[0].research_summary.is_some());
}

/// Provider where only the first discovery worker answers; the other nine
/// hang until the worker deadline kills them.
struct SlowNineProvider {
    discovery_calls: AtomicU32,
}

#[async_trait]
impl LlmProvider for SlowNineProvider {
    async fn complete(&self, req: &LlmRequest) -> Result<LlmRaw, LlmError> {
        match req.schema_name {
            "discovery_factors" => {
                let call = self.discovery_calls.fetch_add(1, Ordering::SeqCst);
                if call > 0 {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                }
                ok_raw(json!({
                    "factors": (1..=5).map(|i| json!({
                        "name": format!("Factor {i}"),
                        "description": format!("Driver number {i}"),
                        "category": "general"
                    })).collect::<Vec<_>>()
                }))
            }
            "validated_factors" => ok_raw(json!({
                "factors": (1..=5).map(|i| json!({
                    "name": format!("Factor {i}"),
                    "description": format!("Driver number {i}"),
                    "category": "general"
                })).collect::<Vec<_>>()
            })),
            "factor_ratings" => ok_raw(json!({
                "ratings": (1..=5).map(|i| json!({
                    "name": format!("Factor {i}"),
                    "score": 10 - i
                })).collect::<Vec<_>>()
            })),
            "factor_research" => ok_raw(json!({"summary": "evidence"})),
            "forecast_synthesis" => ok_raw(json!({
                "prediction_probability": 0.5,
                "confidence": 0.6,
                "reasoning": "mixed evidence",
                "key_factors": ["Factor 1"]
            })),
            other => Err(LlmError::transport(format!("unexpected schema {other}"))),
        }
    }
}

/// Scenario: phase quorum. One of ten discovery workers succeeding is
/// enough; the session still completes.
#[tokio::test]
async fn phase_quorum_survives_nine_timeouts() {
    let store = Store::in_memory().unwrap();
    let orchestrator = orchestrator(
        &store,
        Arc::new(SlowNineProvider {
            discovery_calls: AtomicU32::new(0),
        }),
    );
    let session_id = common::insert_session(&store, "Quorum question").await;

    let counts = AgentCounts {
        phase_1_discovery: Some(10),
        phase_3_research: Some(2),
        ..Default::default()
    };
    let mut config = config(counts, vec![ForecasterClass::Balanced]);
    config.worker_timeout = Duration::from_millis(500);

    let outcome = orchestrator.run(&session_id, &config).await.unwrap();
    assert_eq!(outcome.status, SessionStatus::Completed);

    let session = store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Completed);

    // Phase 2 received the single survivor's five factors.
    let factors = store.list_factors(&session_id).await.unwrap();
    assert_eq!(factors.len(), 5);

    let logs = store.list_agent_logs(&session_id).await.unwrap();
    let timed_out: Vec<_> = logs
        .iter()
        .filter(|l| l.status == WorkerStatus::Failed)
        .collect();
    assert_eq!(timed_out.len(), 9);
    assert!(timed_out
        .iter()
        .all(|l| l.error_message.as_deref() == Some("timeout")));
}

/// Provider that always fails without retry appeal.
struct DeadProvider;

#[async_trait]
impl LlmProvider for DeadProvider {
    async fn complete(&self, _req: &LlmRequest) -> Result<LlmRaw, LlmError> {
        Err(LlmError::Transport {
            status: Some(400),
            message: "nope".to_string(),
        })
    }
}

/// Boundary: a single discovery worker with zero successes fails the
/// session.
#[tokio::test]
async fn single_discovery_worker_failing_fails_session() {
    let store = Store::in_memory().unwrap();
    let orchestrator = orchestrator(&store, Arc::new(DeadProvider));
    let session_id = common::insert_session(&store, "Doomed question").await;

    let counts = AgentCounts {
        phase_1_discovery: Some(1),
        ..Default::default()
    };
    let outcome = orchestrator
        .run(&session_id, &config(counts, vec![ForecasterClass::Balanced]))
        .await
        .unwrap();

    assert_eq!(outcome.status, SessionStatus::Failed);
    let session = store.get_session(&session_id).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert!(session
        .error_message
        .as_deref()
        .unwrap()
        .contains("discovery"));
    assert!(session.completed_at.is_some());

    // No forecaster rows were ever spawned.
    let responses = store.list_forecaster_responses(&session_id).await.unwrap();
    assert!(responses.is_empty());
}

/// Running all five personalities yields five independent response rows.
#[tokio::test]
async fn all_forecaster_classes_emit_one_row_each() {
    let store = Store::in_memory().unwrap();
    let orchestrator = orchestrator(&store, Arc::new(FixedProvider));
    let session_id = common::insert_session(&store, "Run them all").await;

    let counts = AgentCounts {
        phase_1_discovery: Some(2),
        phase_3_research: Some(2),
        ..Default::default()
    };
    let outcome = orchestrator
        .run(&session_id, &config(counts, ForecasterClass::ALL.to_vec()))
        .await
        .unwrap();

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.seeds.len(), 5);

    let responses = store.list_forecaster_responses(&session_id).await.unwrap();
    assert_eq!(responses.len(), 5);
    let mut classes: Vec<_> = responses.iter().map(|r| r.forecaster_class).collect();
    classes.sort_by_key(|c| c.as_str());
    classes.dedup();
    assert_eq!(classes.len(), 5);
    for response in &responses {
        assert_eq!(response.status, WorkerStatus::Completed);
        let p = response.prediction_probability.unwrap();
        let c = response.confidence.unwrap();
        assert!((0.0..=1.0).contains(&p));
        assert!((0.0..=1.0).contains(&c));
    }
}

/// Provider that stalls research forever so external cancellation can
/// interrupt mid-phase.
struct StallAtResearchProvider;

#[async_trait]
impl LlmProvider for StallAtResearchProvider {
    async fn complete(&self, req: &LlmRequest) -> Result<LlmRaw, LlmError> {
        match req.schema_name {
            "discovery_factors" | "validated_factors" => {
                ok_raw(json!({"factors": [macro_factor()]}))
            }
            "factor_ratings" => ok_raw(json!({
                "ratings": [{"name": "Macroeconomic trend", "score": 8.0}]
            })),
            _ => {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Err(LlmError::Timeout)
            }
        }
    }
}

/// Externally flipping the session to failed aborts in-flight workers
/// with a cancelled log.
#[tokio::test]
async fn external_failure_cancels_in_flight_workers() {
    let store = Store::in_memory().unwrap();
    let orchestrator = orchestrator(&store, Arc::new(StallAtResearchProvider));
    let session_id = common::insert_session(&store, "Cancel me").await;

    let counts = AgentCounts {
        phase_1_discovery: Some(1),
        phase_3_research: Some(2),
        ..Default::default()
    };
    let run = {
        let orchestrator = orchestrator.clone();
        let session_id = session_id.clone();
        let config = config(counts, vec![ForecasterClass::Balanced]);
        tokio::spawn(async move { orchestrator.run(&session_id, &config).await })
    };

    // Wait until research workers are in flight.
    let mut in_research = false;
    for _ in 0..100 {
        let logs = store.list_agent_logs(&session_id).await.unwrap();
        if logs.iter().any(|l| {
            l.agent_name.starts_with("historical") || l.agent_name.starts_with("current")
        }) {
            in_research = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(in_research, "pipeline never reached research");

    store
        .set_session_status(&session_id, SessionStatus::Failed, Some("external cancel"))
        .await
        .unwrap();

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.status, SessionStatus::Failed);

    let logs = store.list_agent_logs(&session_id).await.unwrap();
    let cancelled = logs
        .iter()
        .filter(|l| l.error_message.as_deref() == Some("cancelled"))
        .count();
    assert!(cancelled >= 1, "expected cancelled worker logs");
    // Every log reached a terminal state exactly once.
    assert!(logs.iter().all(|l| l.status != WorkerStatus::Running));
}
