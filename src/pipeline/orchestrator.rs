//! Phase-gated orchestrator.
//!
//! Drives a session through discovery, validation, research and synthesis.
//! Each phase fans its workers out in parallel and completes only when all
//! of them reached a terminal state; the next phase starts after that
//! barrier. Factor and response hand-off between phases is in-memory; row
//! writes exist for observers.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::llm::schema::{FactorCandidate, FactorRating, PhaseOutput};
use crate::llm::{
    DiscoveryOutput, LlmOptions, RatingOutput, ResearchOutput, StructuredLlm, SynthesisOutput,
    ValidationOutput,
};
use crate::models::{
    AgentLogRow, FactorRow, ForecasterClass, ForecasterResponseRow, LiveEvent, PhaseDurations,
    ResolvedCounts, SessionPhase, SessionStatus, WorkerPhase, WorkerStatus,
};
use crate::pipeline::prompts;
use crate::store::db::normalize_factor_name;
use crate::store::{Broadcaster, Store};

/// Factors carried from validation into research and synthesis.
const TOP_K_FACTORS: usize = 5;

/// How often in-flight phases check for external cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub counts: ResolvedCounts,
    pub classes: Vec<ForecasterClass>,
    pub worker_timeout: Duration,
    pub max_retries: u32,
    /// Ceiling on concurrent LLM requests; defaults to the phase's worker
    /// count when unset.
    pub max_concurrent: Option<usize>,
    /// Whether pipeline success marks the session `completed`. A session
    /// that continues into the trading simulation stays `running` until
    /// the scheduler's complete call.
    pub finalize_session: bool,
}

impl PipelineConfig {
    pub fn new(counts: ResolvedCounts, classes: Vec<ForecasterClass>) -> Self {
        Self {
            counts,
            classes,
            worker_timeout: Duration::from_secs(300),
            max_retries: 3,
            max_concurrent: None,
            finalize_session: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub session_id: String,
    pub status: SessionStatus,
    /// Per-personality seed probabilities handed to the trading simulation.
    pub seeds: HashMap<ForecasterClass, f64>,
    pub responses: Vec<ForecasterResponseRow>,
    pub durations: PhaseDurations,
}

impl PipelineOutcome {
    fn failed(session_id: &str, durations: PhaseDurations) -> Self {
        Self {
            session_id: session_id.to_string(),
            status: SessionStatus::Failed,
            seeds: HashMap::new(),
            responses: Vec::new(),
            durations,
        }
    }
}

/// One unit of fan-out work inside a phase. `tag` carries phase-specific
/// routing (the factor a research worker is assigned to, the class a
/// synthesizer speaks for).
struct WorkerJob {
    agent_name: String,
    system: String,
    user: String,
    options: LlmOptions,
    tag: String,
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Store,
    broadcaster: Broadcaster,
    llm: StructuredLlm,
}

impl Orchestrator {
    pub fn new(store: Store, broadcaster: Broadcaster, llm: StructuredLlm) -> Self {
        Self {
            store,
            broadcaster,
            llm,
        }
    }

    /// Run the four phases for an existing session row. Always leaves the
    /// session in exactly one of `completed` or `failed`.
    pub async fn run(&self, session_id: &str, config: &PipelineConfig) -> Result<PipelineOutcome> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| anyhow!("session {session_id} not found"))?;

        self.store.mark_session_started(session_id).await?;

        // External cancellation: a watcher polls the session row and flips
        // the watch flag when the status was set to failed from outside.
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let watcher = {
            let store = self.store.clone();
            let id = session_id.to_string();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
                    match store.get_session(&id).await {
                        Ok(Some(row)) if row.status == SessionStatus::Failed => {
                            let _ = cancel_tx.send(true);
                            break;
                        }
                        Ok(Some(row)) if row.status.is_terminal() => break,
                        Ok(Some(_)) => {}
                        _ => {
                            let _ = cancel_tx.send(true);
                            break;
                        }
                    }
                }
            })
        };

        let outcome = self
            .run_phases(session_id, &session.question_text, session.question_type, config, cancel_rx)
            .await;
        watcher.abort();
        outcome
    }

    async fn run_phases(
        &self,
        session_id: &str,
        question: &str,
        question_type: crate::models::QuestionType,
        config: &PipelineConfig,
        cancel: watch::Receiver<bool>,
    ) -> Result<PipelineOutcome> {
        let mut durations = PhaseDurations::default();
        let base_options = LlmOptions {
            max_retries: config.max_retries,
            ..Default::default()
        };

        // -- Phase 1: discovery ---------------------------------------------
        self.enter_phase(session_id, SessionPhase::Discovery).await?;
        let started = Instant::now();

        let jobs: Vec<WorkerJob> = (0..config.counts.discovery)
            .map(|i| WorkerJob {
                agent_name: format!("discovery_{:02}", i + 1),
                system: prompts::discovery_system(),
                user: prompts::discovery_user(question, question_type),
                options: base_options.clone(),
                tag: String::new(),
            })
            .collect();
        let discovered = self
            .run_batch::<DiscoveryOutput>(session_id, WorkerPhase::Discovery, jobs, config, &cancel)
            .await;
        durations.discovery_ms = started.elapsed().as_millis() as u64;

        if discovered.is_empty() {
            return self
                .fail(session_id, SessionPhase::Discovery, "no discovery worker succeeded", durations)
                .await;
        }
        let candidates: Vec<FactorCandidate> = discovered
            .into_iter()
            .flat_map(|(_, _, out)| out.factors)
            .collect();
        info!(session_id, candidates = candidates.len(), "🔍 Discovery complete");

        // -- Phase 2: validation --------------------------------------------
        if *cancel.borrow() {
            return self.fail(session_id, SessionPhase::Validation, "cancelled", durations).await;
        }
        self.enter_phase(session_id, SessionPhase::Validation).await?;
        let started = Instant::now();

        let validator_job = WorkerJob {
            agent_name: "validator".to_string(),
            system: prompts::validator_system(),
            user: prompts::validator_user(question, &candidates),
            options: base_options.clone(),
            tag: String::new(),
        };
        let validated = self
            .run_batch::<ValidationOutput>(
                session_id,
                WorkerPhase::Validation,
                vec![validator_job],
                config,
                &cancel,
            )
            .await;
        let Some((_, _, validation)) = validated.into_iter().next() else {
            durations.validation_ms = started.elapsed().as_millis() as u64;
            return self
                .fail(session_id, SessionPhase::Validation, "validator produced no output", durations)
                .await;
        };

        // The validator is asked to dedup; enforce name uniqueness anyway so
        // the (session_id, normalized_name) constraint can never trip.
        let mut seen = HashSet::new();
        let unique: Vec<FactorCandidate> = validation
            .factors
            .into_iter()
            .filter(|f| seen.insert(normalize_factor_name(&f.name)))
            .collect();

        let ratings = match self
            .run_rating(session_id, question, &unique, config, &cancel, &base_options)
            .await
        {
            Some(ratings) => ratings,
            None => {
                durations.validation_ms = started.elapsed().as_millis() as u64;
                return self
                    .fail(session_id, SessionPhase::Validation, "rating produced no output", durations)
                    .await;
            }
        };
        durations.validation_ms = started.elapsed().as_millis() as u64;

        let mut score_by_name: HashMap<String, f64> = HashMap::new();
        for rating in &ratings {
            score_by_name
                .entry(normalize_factor_name(&rating.name))
                .or_insert(rating.score);
        }
        let mut scored: Vec<(FactorCandidate, f64)> = unique
            .into_iter()
            .map(|f| {
                let score = score_by_name
                    .get(&normalize_factor_name(&f.name))
                    .copied()
                    .unwrap_or(0.0);
                (f, score)
            })
            .collect();
        // Highest importance first; lexicographic name breaks ties.
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.name.cmp(&b.0.name))
        });
        scored.truncate(TOP_K_FACTORS);

        if scored.is_empty() {
            return self
                .fail(session_id, SessionPhase::Validation, "no factors survived validation", durations)
                .await;
        }

        let mut factor_rows = Vec::new();
        for (candidate, score) in &scored {
            let stored = self
                .store
                .upsert_factor(&FactorRow {
                    id: Uuid::new_v4().to_string(),
                    session_id: session_id.to_string(),
                    name: candidate.name.clone(),
                    description: candidate.description.clone(),
                    category: candidate.category.clone(),
                    importance_score: Some(*score),
                    research_summary: None,
                })
                .await?;
            self.broadcaster.publish(LiveEvent::Factors(stored.clone()));
            factor_rows.push(stored);
        }
        info!(session_id, factors = factor_rows.len(), "✅ Validation complete");

        // -- Phase 3: research ----------------------------------------------
        if *cancel.borrow() {
            return self.fail(session_id, SessionPhase::Research, "cancelled", durations).await;
        }
        self.enter_phase(session_id, SessionPhase::Research).await?;
        let started = Instant::now();

        let mut jobs = Vec::new();
        for i in 0..config.counts.historical {
            let factor = &factor_rows[i as usize % factor_rows.len()];
            jobs.push(WorkerJob {
                agent_name: format!("historical_{:02}", i + 1),
                system: prompts::historical_system(),
                user: prompts::research_user(question, &factor.name, &factor.description),
                options: base_options.clone(),
                tag: normalize_factor_name(&factor.name),
            });
        }
        for i in 0..config.counts.current {
            let factor = &factor_rows[i as usize % factor_rows.len()];
            jobs.push(WorkerJob {
                agent_name: format!("current_{:02}", i + 1),
                system: prompts::current_system(),
                user: prompts::research_user(question, &factor.name, &factor.description),
                options: LlmOptions {
                    web_search: true,
                    ..base_options.clone()
                },
                tag: normalize_factor_name(&factor.name),
            });
        }
        let research = self
            .run_batch::<ResearchOutput>(session_id, WorkerPhase::Research, jobs, config, &cancel)
            .await;
        durations.research_ms = started.elapsed().as_millis() as u64;

        // Concatenate each factor's summaries in canonical worker order.
        let mut researched: Vec<FactorRow> = Vec::new();
        for factor in &factor_rows {
            let key = normalize_factor_name(&factor.name);
            let summaries: Vec<&str> = research
                .iter()
                .filter(|(_, tag, _)| *tag == key)
                .map(|(_, _, out)| out.summary.as_str())
                .collect();
            if summaries.is_empty() {
                warn!(session_id, factor = %factor.name, "Factor excluded: no research survived");
                continue;
            }
            let combined = summaries.join("\n\n");
            if let Some(updated) = self
                .store
                .set_factor_summary(session_id, &factor.name, &combined)
                .await?
            {
                self.broadcaster.publish(LiveEvent::Factors(updated.clone()));
                researched.push(updated);
            }
        }
        if researched.is_empty() {
            return self
                .fail(session_id, SessionPhase::Research, "no factor survived research", durations)
                .await;
        }
        info!(session_id, factors = researched.len(), "📚 Research complete");

        // -- Phase 4: synthesis ---------------------------------------------
        if *cancel.borrow() {
            return self.fail(session_id, SessionPhase::Synthesis, "cancelled", durations).await;
        }
        self.enter_phase(session_id, SessionPhase::Synthesis).await?;
        let started = Instant::now();

        let jobs: Vec<WorkerJob> = config
            .classes
            .iter()
            .map(|class| WorkerJob {
                agent_name: format!("synthesizer_{}", class.as_str()),
                system: prompts::synthesis_system(*class),
                user: prompts::synthesis_user(question, &researched),
                options: base_options.clone(),
                tag: class.as_str().to_string(),
            })
            .collect();
        let synthesized = self
            .run_batch::<SynthesisOutput>(session_id, WorkerPhase::Synthesis, jobs, config, &cancel)
            .await;
        durations.synthesis_ms = started.elapsed().as_millis() as u64;

        let mut seeds = HashMap::new();
        let mut responses = Vec::new();
        for class in &config.classes {
            let output = synthesized
                .iter()
                .find(|(_, tag, _)| tag == class.as_str())
                .map(|(_, _, out)| out.clone());
            let row = match output {
                Some(out) => {
                    seeds.insert(*class, out.prediction_probability);
                    ForecasterResponseRow {
                        id: Uuid::new_v4().to_string(),
                        session_id: session_id.to_string(),
                        forecaster_class: *class,
                        prediction_probability: Some(out.prediction_probability),
                        confidence: Some(out.confidence),
                        reasoning: Some(out.reasoning),
                        key_factors: out.key_factors,
                        phase_durations: Some(durations.clone()),
                        status: WorkerStatus::Completed,
                        created_at: Utc::now(),
                    }
                }
                None => ForecasterResponseRow {
                    id: Uuid::new_v4().to_string(),
                    session_id: session_id.to_string(),
                    forecaster_class: *class,
                    prediction_probability: None,
                    confidence: None,
                    reasoning: None,
                    key_factors: Vec::new(),
                    phase_durations: Some(durations.clone()),
                    status: WorkerStatus::Failed,
                    created_at: Utc::now(),
                },
            };
            self.store.insert_forecaster_response(&row).await?;
            self.broadcaster
                .publish(LiveEvent::ForecasterResponses(row.clone()));
            responses.push(row);
        }

        if seeds.is_empty() {
            let mut outcome = self
                .fail(session_id, SessionPhase::Synthesis, "every synthesizer failed", durations)
                .await?;
            outcome.responses = responses;
            return Ok(outcome);
        }

        self.store
            .set_session_phase(session_id, SessionPhase::Completed)
            .await?;
        if config.finalize_session {
            self.store
                .set_session_status(session_id, SessionStatus::Completed, None)
                .await?;
        }
        self.publish_session(session_id).await;
        metrics::increment_counter!("pipeline_sessions_completed_total");
        info!(session_id, personalities = seeds.len(), "🎯 Synthesis complete, session done");

        Ok(PipelineOutcome {
            session_id: session_id.to_string(),
            status: SessionStatus::Completed,
            seeds,
            responses,
            durations,
        })
    }

    /// The rating step of phase 2: one merged rating-consensus worker in
    /// the 2-agent layout, separate rater and consensus workers in the
    /// 3-agent layout.
    async fn run_rating(
        &self,
        session_id: &str,
        question: &str,
        factors: &[FactorCandidate],
        config: &PipelineConfig,
        cancel: &watch::Receiver<bool>,
        base_options: &LlmOptions,
    ) -> Option<Vec<FactorRating>> {
        if config.counts.validation == 3 {
            let rater_job = WorkerJob {
                agent_name: "rater".to_string(),
                system: prompts::rating_system(),
                user: prompts::rating_user(question, factors),
                options: base_options.clone(),
                tag: String::new(),
            };
            let rated = self
                .run_batch::<RatingOutput>(session_id, WorkerPhase::Validation, vec![rater_job], config, cancel)
                .await;
            let (_, _, rater_out) = rated.into_iter().next()?;

            let consensus_job = WorkerJob {
                agent_name: "consensus".to_string(),
                system: prompts::consensus_system(),
                user: prompts::consensus_user(question, factors, &rater_out.ratings),
                options: base_options.clone(),
                tag: String::new(),
            };
            let consensus = self
                .run_batch::<RatingOutput>(
                    session_id,
                    WorkerPhase::Validation,
                    vec![consensus_job],
                    config,
                    cancel,
                )
                .await;
            consensus.into_iter().next().map(|(_, _, out)| out.ratings)
        } else {
            let job = WorkerJob {
                agent_name: "rating_consensus".to_string(),
                system: prompts::rating_system(),
                user: prompts::rating_user(question, factors),
                options: base_options.clone(),
                tag: String::new(),
            };
            let rated = self
                .run_batch::<RatingOutput>(session_id, WorkerPhase::Validation, vec![job], config, cancel)
                .await;
            rated.into_iter().next().map(|(_, _, out)| out.ratings)
        }
    }

    /// Fan a batch of workers out, wait for all of them to reach a terminal
    /// state, and return the successes sorted into canonical order
    /// (agent name, then completion order for equal names).
    async fn run_batch<T: PhaseOutput + 'static>(
        &self,
        session_id: &str,
        phase: WorkerPhase,
        jobs: Vec<WorkerJob>,
        config: &PipelineConfig,
        cancel: &watch::Receiver<bool>,
    ) -> Vec<(String, String, T)> {
        let limit = config.max_concurrent.unwrap_or(jobs.len().max(1));
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut set: JoinSet<Option<(String, String, T)>> = JoinSet::new();

        for job in jobs {
            let this = self.clone();
            let session_id = session_id.to_string();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let worker_timeout = config.worker_timeout;
            set.spawn(async move {
                let _permit = semaphore.acquire().await.ok()?;
                this.run_worker::<T>(&session_id, job, phase, worker_timeout, cancel)
                    .await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => warn!(session_id, phase = phase.as_str(), error = %e, "Worker task panicked"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// One worker: AgentLog(running) before invocation, exactly one
    /// terminal update after. Returns the parsed output on success.
    async fn run_worker<T: PhaseOutput>(
        &self,
        session_id: &str,
        job: WorkerJob,
        phase: WorkerPhase,
        worker_timeout: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> Option<(String, String, T)> {
        let log = AgentLogRow {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            agent_name: job.agent_name.clone(),
            phase,
            status: WorkerStatus::Running,
            output_data: None,
            error_message: None,
            tokens_used: 0,
            created_at: Utc::now(),
            completed_at: None,
        };
        if let Err(e) = self.store.insert_agent_log(&log).await {
            warn!(session_id, agent = %job.agent_name, error = %e, "Failed to record worker spawn");
            return None;
        }
        self.broadcaster.publish(LiveEvent::AgentLogs(log.clone()));

        let work = self.llm.generate::<T>(&job.system, &job.user, job.options);
        let outcome = tokio::select! {
            _ = wait_cancelled(&mut cancel) => Err("cancelled".to_string()),
            result = tokio::time::timeout(worker_timeout, work) => match result {
                Err(_) => Err("timeout".to_string()),
                Ok(Err(e)) => Err(e.to_string()),
                Ok(Ok(r)) => Ok(r),
            },
        };

        match outcome {
            Ok(result) => {
                let tokens = result.total_tokens() as i64;
                let output = serde_json::to_value(&result.value).ok();
                if let Ok(Some(updated)) = self
                    .store
                    .finish_agent_log(&log.id, WorkerStatus::Completed, output.as_ref(), None, tokens)
                    .await
                {
                    self.broadcaster.publish(LiveEvent::AgentLogs(updated));
                }
                let _ = self.store.add_session_tokens(session_id, tokens).await;
                Some((job.agent_name, job.tag, result.value))
            }
            Err(reason) => {
                warn!(
                    session_id,
                    agent = %job.agent_name,
                    phase = phase.as_str(),
                    reason = %reason,
                    "Worker failed"
                );
                if let Ok(Some(updated)) = self
                    .store
                    .finish_agent_log(&log.id, WorkerStatus::Failed, None, Some(&reason), 0)
                    .await
                {
                    self.broadcaster.publish(LiveEvent::AgentLogs(updated));
                }
                None
            }
        }
    }

    async fn enter_phase(&self, session_id: &str, phase: SessionPhase) -> Result<()> {
        self.store
            .set_session_phase(session_id, phase)
            .await
            .context("set session phase")?;
        self.publish_session(session_id).await;
        Ok(())
    }

    async fn fail(
        &self,
        session_id: &str,
        phase: SessionPhase,
        reason: &str,
        durations: PhaseDurations,
    ) -> Result<PipelineOutcome> {
        let message = format!("phase {} failed: {reason}", phase.as_str());
        warn!(session_id, phase = phase.as_str(), reason, "❌ Session failed");
        self.store
            .set_session_status(session_id, SessionStatus::Failed, Some(&message))
            .await?;
        self.publish_session(session_id).await;
        metrics::increment_counter!("pipeline_sessions_failed_total");
        Ok(PipelineOutcome::failed(session_id, durations))
    }

    async fn publish_session(&self, session_id: &str) {
        if let Ok(Some(row)) = self.store.get_session(session_id).await {
            self.broadcaster.publish(LiveEvent::Sessions(row));
        }
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender dropped without cancelling; never resolve.
            std::future::pending::<()>().await;
        }
    }
}
