//! Core row types, enums and configuration shared across the pipeline,
//! the matching engine and the trading simulation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Question types a forecasting session can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Binary,
    Numeric,
    Categorical,
}

impl QuestionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionType::Binary => "binary",
            QuestionType::Numeric => "numeric",
            QuestionType::Categorical => "categorical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "binary" => Some(Self::Binary),
            "numeric" => Some(Self::Numeric),
            "categorical" => Some(Self::Categorical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

/// Session lifecycle position. `Created` and `Completed` bracket the four
/// worker phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Created,
    Discovery,
    Validation,
    Research,
    Synthesis,
    Completed,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Created => "created",
            SessionPhase::Discovery => "discovery",
            SessionPhase::Validation => "validation",
            SessionPhase::Research => "research",
            SessionPhase::Synthesis => "synthesis",
            SessionPhase::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "discovery" => Some(Self::Discovery),
            "validation" => Some(Self::Validation),
            "research" => Some(Self::Research),
            "synthesis" => Some(Self::Synthesis),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Worker phases as recorded on agent logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Discovery,
    Validation,
    Research,
    Synthesis,
}

impl WorkerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerPhase::Discovery => "discovery",
            WorkerPhase::Validation => "validation",
            WorkerPhase::Research => "research",
            WorkerPhase::Synthesis => "synthesis",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "discovery" => Some(Self::Discovery),
            "validation" => Some(Self::Validation),
            "research" => Some(Self::Research),
            "synthesis" => Some(Self::Synthesis),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Running,
    Completed,
    Failed,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Running => "running",
            WorkerStatus::Completed => "completed",
            WorkerStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Synthesis personalities. Each modulates the synthesis system prompt and
/// seeds the matching fundamental trader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecasterClass {
    Conservative,
    Momentum,
    Historical,
    Realtime,
    Balanced,
}

impl ForecasterClass {
    pub const ALL: [ForecasterClass; 5] = [
        ForecasterClass::Conservative,
        ForecasterClass::Momentum,
        ForecasterClass::Historical,
        ForecasterClass::Realtime,
        ForecasterClass::Balanced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ForecasterClass::Conservative => "conservative",
            ForecasterClass::Momentum => "momentum",
            ForecasterClass::Historical => "historical",
            ForecasterClass::Realtime => "realtime",
            ForecasterClass::Balanced => "balanced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "conservative" => Some(Self::Conservative),
            "momentum" => Some(Self::Momentum),
            "historical" => Some(Self::Historical),
            "realtime" => Some(Self::Realtime),
            "balanced" => Some(Self::Balanced),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "partially_filled" => Some(Self::PartiallyFilled),
            "filled" => Some(Self::Filled),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraderType {
    Fundamental,
    Noise,
    User,
}

impl TraderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraderType::Fundamental => "fundamental",
            TraderType::Noise => "noise",
            TraderType::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fundamental" => Some(Self::Fundamental),
            "noise" => Some(Self::Noise),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

/// The closed set of 18 trader identities. Orders reference these names;
/// behavioral parameters live with the trader pool.
pub const TRADER_IDENTITIES: [(&str, TraderType); 18] = [
    ("fund_conservative", TraderType::Fundamental),
    ("fund_momentum", TraderType::Fundamental),
    ("fund_historical", TraderType::Fundamental),
    ("fund_realtime", TraderType::Fundamental),
    ("fund_balanced", TraderType::Fundamental),
    ("sent_tech", TraderType::Noise),
    ("sent_politics", TraderType::Noise),
    ("sent_sports", TraderType::Noise),
    ("sent_finance", TraderType::Noise),
    ("sent_crypto", TraderType::Noise),
    ("sent_science", TraderType::Noise),
    ("sent_culture", TraderType::Noise),
    ("sent_energy", TraderType::Noise),
    ("sent_health", TraderType::Noise),
    ("track_whalewatch", TraderType::User),
    ("track_newsdesk", TraderType::User),
    ("track_contrarian", TraderType::User),
    ("track_quant", TraderType::User),
];

/// Resolve the trader type for a known identity. Unknown names (possible
/// when the matching engine is driven directly) default to noise.
pub fn trader_type_of(name: &str) -> TraderType {
    TRADER_IDENTITIES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, t)| *t)
        .unwrap_or(TraderType::Noise)
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub id: String,
    pub question_text: String,
    pub question_type: QuestionType,
    pub status: SessionStatus,
    pub current_phase: SessionPhase,
    pub tokens_used: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLogRow {
    pub id: String,
    pub session_id: String,
    pub agent_name: String,
    pub phase: WorkerPhase,
    pub status: WorkerStatus,
    pub output_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub tokens_used: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorRow {
    pub id: String,
    pub session_id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub importance_score: Option<f64>,
    pub research_summary: Option<String>,
}

/// Wall-clock milliseconds spent in each phase. Intra-phase parallel time
/// counts as `max(worker)`, not the sum.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseDurations {
    pub discovery_ms: u64,
    pub validation_ms: u64,
    pub research_ms: u64,
    pub synthesis_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecasterResponseRow {
    pub id: String,
    pub session_id: String,
    pub forecaster_class: ForecasterClass,
    pub prediction_probability: Option<f64>,
    pub confidence: Option<f64>,
    pub reasoning: Option<String>,
    pub key_factors: Vec<String>,
    pub phase_durations: Option<PhaseDurations>,
    pub status: WorkerStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRow {
    pub id: String,
    pub session_id: String,
    pub trader_name: String,
    pub side: Side,
    /// Probability-of-YES in whole cents, 0..=100.
    pub price: i64,
    pub quantity: i64,
    pub filled_quantity: i64,
    pub status: OrderStatus,
    /// Per-session monotonic arrival sequence; price-time tie-break key.
    pub seq: i64,
    pub created_at: DateTime<Utc>,
}

impl OrderRow {
    pub fn remaining(&self) -> i64 {
        self.quantity - self.filled_quantity
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRow {
    pub id: String,
    pub session_id: String,
    pub buyer_name: String,
    pub seller_name: String,
    pub price: i64,
    pub quantity: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraderStateRow {
    pub id: String,
    pub session_id: String,
    pub name: String,
    pub trader_type: TraderType,
    /// Net contracts held; negative means short. Sums to zero per session.
    pub position: i64,
    /// Notional dollars; starts at zero, trade deltas sum to zero.
    pub cash: f64,
    pub pnl: f64,
    pub system_prompt: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Agent counts
// ---------------------------------------------------------------------------

/// Per-phase worker counts as accepted on the API. Unset keys fall back to
/// defaults; the legacy `phase_3_research` key splits 50/50 between
/// historical and current workers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentCounts {
    #[serde(default)]
    pub phase_1_discovery: Option<u32>,
    #[serde(default)]
    pub phase_2_validation: Option<u32>,
    #[serde(default)]
    pub phase_3_research: Option<u32>,
    #[serde(default)]
    pub phase_3_historical: Option<u32>,
    #[serde(default)]
    pub phase_3_current: Option<u32>,
    #[serde(default)]
    pub phase_4_synthesis: Option<u32>,
}

/// Effective worker counts after defaulting and validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedCounts {
    pub discovery: u32,
    pub validation: u32,
    pub historical: u32,
    pub current: u32,
}

impl AgentCounts {
    pub const DEFAULT_DISCOVERY: u32 = 10;
    // One historical and one current worker per top factor.
    pub const DEFAULT_HISTORICAL: u32 = 5;
    pub const DEFAULT_CURRENT: u32 = 5;

    /// Validate and resolve the counts. Returns a human-readable rejection
    /// for out-of-range values.
    pub fn resolve(&self) -> Result<ResolvedCounts, String> {
        let discovery = self.phase_1_discovery.unwrap_or(Self::DEFAULT_DISCOVERY);
        if discovery == 0 || discovery > 50 {
            return Err(format!(
                "phase_1_discovery must be in 1..=50, got {discovery}"
            ));
        }

        let validation = self.phase_2_validation.unwrap_or(2);
        if validation != 2 && validation != 3 {
            return Err(format!("phase_2_validation must be 2 or 3, got {validation}"));
        }

        if let Some(n) = self.phase_4_synthesis {
            if n != 1 {
                return Err(format!("phase_4_synthesis is fixed at 1, got {n}"));
            }
        }

        let (historical, current) = match (self.phase_3_historical, self.phase_3_current) {
            (None, None) => match self.phase_3_research {
                // Legacy combined count splits 50/50, historical first.
                Some(total) => (total.div_ceil(2), total / 2),
                None => (Self::DEFAULT_HISTORICAL, Self::DEFAULT_CURRENT),
            },
            (h, c) => (
                h.unwrap_or(Self::DEFAULT_HISTORICAL),
                c.unwrap_or(Self::DEFAULT_CURRENT),
            ),
        };
        if historical + current == 0 {
            return Err("phase 3 requires at least one research worker".to_string());
        }
        if historical > 20 || current > 20 {
            return Err("phase 3 worker counts must be <= 20 per kind".to_string());
        }

        Ok(ResolvedCounts {
            discovery,
            validation,
            historical,
            current,
        })
    }
}

// ---------------------------------------------------------------------------
// Live events (Broadcaster payloads)
// ---------------------------------------------------------------------------

/// Row-change events fanned out to observers. Topic names match the
/// logical pub/sub channels.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    Sessions(SessionRow),
    AgentLogs(AgentLogRow),
    Factors(FactorRow),
    ForecasterResponses(ForecasterResponseRow),
    OrderbookLive { session_id: String },
    Trades(TradeRow),
    TraderStateLive(TraderStateRow),
}

impl LiveEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            LiveEvent::Sessions(_) => "sessions",
            LiveEvent::AgentLogs(_) => "agent_logs",
            LiveEvent::Factors(_) => "factors",
            LiveEvent::ForecasterResponses(_) => "forecaster_responses",
            LiveEvent::OrderbookLive { .. } => "orderbook_live",
            LiveEvent::Trades(_) => "trades",
            LiveEvent::TraderStateLive(_) => "trader_state_live",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            LiveEvent::Sessions(r) => &r.id,
            LiveEvent::AgentLogs(r) => &r.session_id,
            LiveEvent::Factors(r) => &r.session_id,
            LiveEvent::ForecasterResponses(r) => &r.session_id,
            LiveEvent::OrderbookLive { session_id } => session_id,
            LiveEvent::Trades(r) => &r.session_id,
            LiveEvent::TraderStateLive(r) => &r.session_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Application configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub llm_api_key: String,
    pub llm_base_url: String,
    pub llm_model: String,
    pub agent_timeout_seconds: u64,
    pub trading_interval_seconds: u64,
    pub llm_max_retries: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let llm_api_key = std::env::var("LLM_API_KEY")
            .map_err(|_| anyhow::anyhow!("LLM_API_KEY missing (set env var)"))?;
        if llm_api_key.trim().is_empty() {
            anyhow::bail!("LLM_API_KEY empty");
        }

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./foresight.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let llm_base_url = std::env::var("LLM_BASE_URL")
            .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string());

        let llm_model =
            std::env::var("LLM_MODEL").unwrap_or_else(|_| "openai/gpt-4o-mini".to_string());

        let agent_timeout_seconds = std::env::var("AGENT_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);

        let trading_interval_seconds = std::env::var("TRADING_INTERVAL_SECONDS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        let llm_max_retries = std::env::var("LLM_MAX_RETRIES")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .unwrap_or(3);

        Ok(Self {
            database_path,
            port,
            llm_api_key,
            llm_base_url,
            llm_model,
            agent_timeout_seconds,
            trading_interval_seconds,
            llm_max_retries,
        })
    }
}
