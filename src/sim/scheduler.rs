//! Round scheduler: drives the trader pool through repeated decision
//! rounds against the matching engine.
//!
//! One scheduler serves every simulated session. Each session's loop waits
//! for its seed probabilities, then fires all 18 traders concurrently per
//! round off the same pre-round snapshot. A trader whose previous quote
//! call has not returned is skipped for the round, so no trader ever has
//! more than one outstanding quote RPC.

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::market::{book, MatchingEngine};
use crate::models::{
    ForecasterClass, LiveEvent, SessionStatus, TraderStateRow, TraderType,
};
use crate::pipeline::prompts::trader_system_prompt;
use crate::sim::providers::{AccountFeedProvider, SentimentProvider};
use crate::sim::traders::{trader_pool, TraderContext};
use crate::store::{Broadcaster, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SimPhase {
    Initializing,
    Running,
    Stopped,
}

impl SimPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimPhase::Initializing => "initializing",
            SimPhase::Running => "running",
            SimPhase::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SimStatus {
    pub running: bool,
    pub phase: SimPhase,
    pub round_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopSignal {
    Run,
    Stop,
    Complete,
}

struct SimEntry {
    phase: SimPhase,
    round_number: u64,
    stop_tx: watch::Sender<StopSignal>,
    stop_rx: watch::Receiver<StopSignal>,
}

#[derive(Clone)]
pub struct RoundScheduler {
    store: Store,
    broadcaster: Broadcaster,
    engine: MatchingEngine,
    sentiment: Arc<dyn SentimentProvider>,
    feed: Arc<dyn AccountFeedProvider>,
    sessions: Arc<RwLock<HashMap<String, SimEntry>>>,
}

impl RoundScheduler {
    pub fn new(
        store: Store,
        broadcaster: Broadcaster,
        engine: MatchingEngine,
        sentiment: Arc<dyn SentimentProvider>,
        feed: Arc<dyn AccountFeedProvider>,
    ) -> Self {
        Self {
            store,
            broadcaster,
            engine,
            sentiment,
            feed,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Announce a session before its pipeline finishes so observers see
    /// phase `initializing` during round-1 blocking.
    pub fn register(&self, session_id: &str) {
        let mut sessions = self.sessions.write();
        sessions.entry(session_id.to_string()).or_insert_with(|| {
            let (stop_tx, stop_rx) = watch::channel(StopSignal::Run);
            SimEntry {
                phase: SimPhase::Initializing,
                round_number: 0,
                stop_tx,
                stop_rx,
            }
        });
    }

    pub fn status(&self, session_id: &str) -> Option<SimStatus> {
        let sessions = self.sessions.read();
        sessions.get(session_id).map(|entry| SimStatus {
            running: entry.phase == SimPhase::Running,
            phase: entry.phase,
            round_number: entry.round_number,
        })
    }

    /// Request a stop; the loop finishes in-flight quotes first.
    pub fn stop(&self, session_id: &str) -> bool {
        self.signal(session_id, StopSignal::Stop)
    }

    /// Force a registered session's entry to `stopped` without a loop
    /// running (pipeline failed before trading started).
    pub fn mark_stopped(&self, session_id: &str) {
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.phase = SimPhase::Stopped;
        }
    }

    /// Stop and additionally mark the session terminal.
    pub fn complete(&self, session_id: &str) -> bool {
        self.signal(session_id, StopSignal::Complete)
    }

    fn signal(&self, session_id: &str, signal: StopSignal) -> bool {
        let sessions = self.sessions.read();
        match sessions.get(session_id) {
            Some(entry) => entry.stop_tx.send(signal).is_ok(),
            None => false,
        }
    }

    fn set_entry(&self, session_id: &str, phase: SimPhase, round_number: u64) {
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.phase = phase;
            entry.round_number = round_number;
        }
    }

    /// Run the round loop until stopped. Blocks the calling task; callers
    /// spawn it.
    pub async fn run_session(
        &self,
        session_id: &str,
        seeds: HashMap<ForecasterClass, f64>,
        interval: Duration,
    ) -> Result<()> {
        self.register(session_id);
        let Some(mut stop_rx) = ({
            let sessions = self.sessions.read();
            sessions.get(session_id).map(|e| e.stop_rx.clone())
        }) else {
            return Ok(());
        };

        self.seed_traders(session_id).await?;

        // A fundamental trader whose personality did not run this session
        // falls back to the mean of the available seeds.
        let mean_seed = if seeds.is_empty() {
            0.5
        } else {
            seeds.values().sum::<f64>() / seeds.len() as f64
        };

        let busy: HashMap<&'static str, Arc<AtomicBool>> = trader_pool()
            .iter()
            .map(|spec| (spec.name, Arc::new(AtomicBool::new(false))))
            .collect();

        let mut round_number = 0u64;
        self.set_entry(session_id, SimPhase::Running, round_number);
        info!(session_id, interval_s = interval.as_secs_f64(), "📈 Trading simulation running");

        let rounds = self
            .run_rounds(session_id, &seeds, mean_seed, interval, &busy, &mut stop_rx, &mut round_number)
            .await;

        // Let in-flight quotes land before reporting stopped.
        for _ in 0..400 {
            if busy.values().all(|f| !f.load(Ordering::Acquire)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        self.set_entry(session_id, SimPhase::Stopped, round_number);
        let final_signal = rounds?;
        if final_signal == StopSignal::Complete {
            self.store
                .set_session_status(session_id, SessionStatus::Completed, None)
                .await?;
            if let Ok(Some(row)) = self.store.get_session(session_id).await {
                self.broadcaster.publish(LiveEvent::Sessions(row));
            }
        }
        info!(session_id, rounds = round_number, "🛑 Trading simulation stopped");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_rounds(
        &self,
        session_id: &str,
        seeds: &HashMap<ForecasterClass, f64>,
        mean_seed: f64,
        interval: Duration,
        busy: &HashMap<&'static str, Arc<AtomicBool>>,
        stop_rx: &mut watch::Receiver<StopSignal>,
        round_number: &mut u64,
    ) -> Result<StopSignal> {
        let final_signal = loop {
            let signal = *stop_rx.borrow();
            if signal != StopSignal::Run {
                break signal;
            }

            // Every trader in this round decides off the same snapshot.
            let snapshot = book::market_snapshot(&self.store, session_id).await?;
            let positions: HashMap<String, i64> = self
                .store
                .list_trader_states(session_id)
                .await?
                .into_iter()
                .map(|s| (s.name.clone(), s.position))
                .collect();

            for spec in trader_pool() {
                let flag = busy[spec.name].clone();
                if flag.swap(true, Ordering::AcqRel) {
                    info!(
                        session_id,
                        trader = spec.name,
                        round = *round_number,
                        "Skipping round, previous quote still in flight"
                    );
                    continue;
                }

                let ctx = TraderContext {
                    snapshot,
                    position: positions.get(spec.name).copied().unwrap_or(0),
                    seed_probability: match spec.trader_type {
                        TraderType::Fundamental => Some(
                            spec.class
                                .and_then(|c| seeds.get(&c).copied())
                                .unwrap_or(mean_seed),
                        ),
                        _ => None,
                    },
                    sentiment: spec.sphere.map(|s| self.sentiment.sample(s)),
                    posts: spec
                        .handle
                        .map(|h| self.feed.latest(h))
                        .unwrap_or_default(),
                    round: *round_number,
                };

                let engine = self.engine.clone();
                let session = session_id.to_string();
                let spec = spec.clone();
                tokio::spawn(async move {
                    let mut rng = round_rng(&session, spec.name, ctx.round);
                    if let Some(quote) = spec.decide(&ctx, &mut rng) {
                        if let Err(e) = engine
                            .place_mm_quotes(&session, spec.name, quote.bid, quote.ask, quote.qty)
                            .await
                        {
                            warn!(session_id = %session, trader = spec.name, error = %e, "Quote placement failed");
                        }
                    }
                    flag.store(false, Ordering::Release);
                });
            }

            *round_number += 1;
            self.set_entry(session_id, SimPhase::Running, *round_number);
            metrics::increment_counter!("trading_rounds_total");

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop_rx.changed() => {}
            }
        };
        Ok(final_signal)
    }

    /// Write the 18 persistent trader rows for a session.
    async fn seed_traders(&self, session_id: &str) -> Result<()> {
        for spec in trader_pool() {
            let row = TraderStateRow {
                id: Uuid::new_v4().to_string(),
                session_id: session_id.to_string(),
                name: spec.name.to_string(),
                trader_type: spec.trader_type,
                position: 0,
                cash: 0.0,
                pnl: 0.0,
                system_prompt: Some(trader_system_prompt(spec.name, spec.persona)),
                updated_at: Utc::now(),
            };
            self.store.seed_trader_state(&row).await?;
            self.broadcaster.publish(LiveEvent::TraderStateLive(row));
        }
        Ok(())
    }
}

fn round_rng(session_id: &str, trader: &str, round: u64) -> ChaCha8Rng {
    let mut hasher = DefaultHasher::new();
    session_id.hash(&mut hasher);
    trader.hash(&mut hasher);
    round.hash(&mut hasher);
    ChaCha8Rng::seed_from_u64(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QuestionType, SessionPhase, SessionRow};
    use crate::sim::providers::{SyntheticFeed, SyntheticSentiment};

    async fn setup() -> (Store, RoundScheduler, String) {
        let store = Store::in_memory().unwrap();
        let broadcaster = Broadcaster::new();
        let engine = MatchingEngine::new(store.clone(), broadcaster.clone());
        let scheduler = RoundScheduler::new(
            store.clone(),
            broadcaster,
            engine,
            Arc::new(SyntheticSentiment::new(1)),
            Arc::new(SyntheticFeed::new(1)),
        );
        let session_id = Uuid::new_v4().to_string();
        store
            .insert_session(&SessionRow {
                id: session_id.clone(),
                question_text: "q".to_string(),
                question_type: QuestionType::Binary,
                status: SessionStatus::Running,
                current_phase: SessionPhase::Created,
                tokens_used: 0,
                error_message: None,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
            })
            .await
            .unwrap();
        (store, scheduler, session_id)
    }

    #[tokio::test]
    async fn status_lifecycle_and_stop() {
        let (store, scheduler, session) = setup().await;
        assert!(scheduler.status(&session).is_none());

        scheduler.register(&session);
        let status = scheduler.status(&session).unwrap();
        assert_eq!(status.phase, SimPhase::Initializing);
        assert!(!status.running);

        let seeds = HashMap::from([(ForecasterClass::Balanced, 0.62)]);
        let handle = {
            let scheduler = scheduler.clone();
            let session = session.clone();
            tokio::spawn(async move {
                scheduler
                    .run_session(&session, seeds, Duration::from_millis(20))
                    .await
            })
        };

        // Let a few rounds pass.
        tokio::time::sleep(Duration::from_millis(120)).await;
        let status = scheduler.status(&session).unwrap();
        assert_eq!(status.phase, SimPhase::Running);
        assert!(status.round_number >= 2);

        assert!(scheduler.stop(&session));
        handle.await.unwrap().unwrap();

        let status = scheduler.status(&session).unwrap();
        assert_eq!(status.phase, SimPhase::Stopped);
        assert!(!status.running);

        // All 18 traders were seeded with personas.
        let states = store.list_trader_states(&session).await.unwrap();
        assert_eq!(states.len(), 18);
        assert!(states.iter().all(|s| s.system_prompt.is_some()));

        // Conservation holds whatever trading happened.
        let position_sum: i64 = states.iter().map(|s| s.position).sum();
        let cash_sum: f64 = states.iter().map(|s| s.cash).sum();
        assert_eq!(position_sum, 0);
        assert!(cash_sum.abs() < 1e-6);
    }

    #[tokio::test]
    async fn complete_marks_session_terminal() {
        let (store, scheduler, session) = setup().await;
        let handle = {
            let scheduler = scheduler.clone();
            let session = session.clone();
            tokio::spawn(async move {
                scheduler
                    .run_session(&session, HashMap::new(), Duration::from_millis(20))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(scheduler.complete(&session));
        handle.await.unwrap().unwrap();

        let row = store.get_session(&session).await.unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn stop_of_unknown_session_is_false() {
        let (_, scheduler, _) = setup().await;
        assert!(!scheduler.stop("nope"));
    }
}
