//! Database-backed session storage.
//!
//! One sqlite file holds every row kind a session owns. WAL mode for
//! concurrent reads during writes, prepared statement caching, and an
//! explicit transaction helper for the matching engine's atomic sections.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::{
    AgentLogRow, FactorRow, ForecasterResponseRow, OrderRow, OrderStatus, PhaseDurations,
    QuestionType, SessionPhase, SessionRow, SessionStatus, Side, TradeRow, TraderStateRow,
    TraderType, WorkerPhase, WorkerStatus,
};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    question_text TEXT NOT NULL,
    question_type TEXT NOT NULL,
    status TEXT NOT NULL,
    current_phase TEXT NOT NULL,
    tokens_used INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_created ON sessions(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status, created_at DESC);

CREATE TABLE IF NOT EXISTS agent_logs (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    agent_name TEXT NOT NULL,
    phase TEXT NOT NULL,
    status TEXT NOT NULL,
    output_data TEXT,
    error_message TEXT,
    tokens_used INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_agent_logs_session ON agent_logs(session_id, created_at ASC);

CREATE TABLE IF NOT EXISTS factors (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    normalized_name TEXT NOT NULL,
    description TEXT NOT NULL,
    category TEXT NOT NULL,
    importance_score REAL,
    research_summary TEXT,
    UNIQUE(session_id, normalized_name)
);

CREATE TABLE IF NOT EXISTS forecaster_responses (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    forecaster_class TEXT NOT NULL,
    prediction_probability REAL,
    confidence REAL,
    reasoning TEXT,
    key_factors TEXT NOT NULL DEFAULT '[]',
    phase_durations TEXT,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(session_id, forecaster_class)
);

CREATE TABLE IF NOT EXISTS orders (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    trader_name TEXT NOT NULL,
    side TEXT NOT NULL,
    price INTEGER NOT NULL,
    quantity INTEGER NOT NULL,
    filled_quantity INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    seq INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_orders_book
    ON orders(session_id, side, status, price, seq);
CREATE INDEX IF NOT EXISTS idx_orders_trader
    ON orders(session_id, trader_name, status);

CREATE TABLE IF NOT EXISTS trades (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    buyer_name TEXT NOT NULL,
    seller_name TEXT NOT NULL,
    price INTEGER NOT NULL,
    quantity INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_trades_session ON trades(session_id, created_at ASC);

CREATE TABLE IF NOT EXISTS trader_state (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    trader_type TEXT NOT NULL,
    position INTEGER NOT NULL DEFAULT 0,
    cash REAL NOT NULL DEFAULT 0,
    pnl REAL NOT NULL DEFAULT 0,
    system_prompt TEXT,
    updated_at TEXT NOT NULL,
    UNIQUE(session_id, name)
);
"#;

fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn ts_from_sql(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn opt_ts_from_sql(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|v| ts_from_sql(&v))
}

/// Lowercased, whitespace-collapsed factor name used for dedup.
pub fn normalize_factor_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        question_text: row.get(1)?,
        question_type: QuestionType::parse(&row.get::<_, String>(2)?)
            .unwrap_or(QuestionType::Binary),
        status: SessionStatus::parse(&row.get::<_, String>(3)?).unwrap_or(SessionStatus::Failed),
        current_phase: SessionPhase::parse(&row.get::<_, String>(4)?)
            .unwrap_or(SessionPhase::Created),
        tokens_used: row.get(5)?,
        error_message: row.get(6)?,
        created_at: ts_from_sql(&row.get::<_, String>(7)?),
        started_at: opt_ts_from_sql(row.get(8)?),
        completed_at: opt_ts_from_sql(row.get(9)?),
    })
}

const SESSION_COLS: &str = "id, question_text, question_type, status, current_phase, \
     tokens_used, error_message, created_at, started_at, completed_at";

fn agent_log_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentLogRow> {
    let output: Option<String> = row.get(5)?;
    Ok(AgentLogRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        agent_name: row.get(2)?,
        phase: WorkerPhase::parse(&row.get::<_, String>(3)?).unwrap_or(WorkerPhase::Discovery),
        status: WorkerStatus::parse(&row.get::<_, String>(4)?).unwrap_or(WorkerStatus::Failed),
        output_data: output.and_then(|s| serde_json::from_str(&s).ok()),
        error_message: row.get(6)?,
        tokens_used: row.get(7)?,
        created_at: ts_from_sql(&row.get::<_, String>(8)?),
        completed_at: opt_ts_from_sql(row.get(9)?),
    })
}

const AGENT_LOG_COLS: &str = "id, session_id, agent_name, phase, status, output_data, \
     error_message, tokens_used, created_at, completed_at";

fn factor_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FactorRow> {
    Ok(FactorRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        category: row.get(4)?,
        importance_score: row.get(5)?,
        research_summary: row.get(6)?,
    })
}

const FACTOR_COLS: &str =
    "id, session_id, name, description, category, importance_score, research_summary";

fn response_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ForecasterResponseRow> {
    let key_factors: String = row.get(6)?;
    let durations: Option<String> = row.get(7)?;
    Ok(ForecasterResponseRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        forecaster_class: crate::models::ForecasterClass::parse(&row.get::<_, String>(2)?)
            .unwrap_or(crate::models::ForecasterClass::Balanced),
        prediction_probability: row.get(3)?,
        confidence: row.get(4)?,
        reasoning: row.get(5)?,
        key_factors: serde_json::from_str(&key_factors).unwrap_or_default(),
        phase_durations: durations.and_then(|s| serde_json::from_str::<PhaseDurations>(&s).ok()),
        status: WorkerStatus::parse(&row.get::<_, String>(8)?).unwrap_or(WorkerStatus::Failed),
        created_at: ts_from_sql(&row.get::<_, String>(9)?),
    })
}

const RESPONSE_COLS: &str = "id, session_id, forecaster_class, prediction_probability, \
     confidence, reasoning, key_factors, phase_durations, status, created_at";

fn order_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderRow> {
    Ok(OrderRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        trader_name: row.get(2)?,
        side: Side::parse(&row.get::<_, String>(3)?).unwrap_or(Side::Buy),
        price: row.get(4)?,
        quantity: row.get(5)?,
        filled_quantity: row.get(6)?,
        status: OrderStatus::parse(&row.get::<_, String>(7)?).unwrap_or(OrderStatus::Cancelled),
        seq: row.get(8)?,
        created_at: ts_from_sql(&row.get::<_, String>(9)?),
    })
}

const ORDER_COLS: &str = "id, session_id, trader_name, side, price, quantity, \
     filled_quantity, status, seq, created_at";

fn trade_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRow> {
    Ok(TradeRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        buyer_name: row.get(2)?,
        seller_name: row.get(3)?,
        price: row.get(4)?,
        quantity: row.get(5)?,
        created_at: ts_from_sql(&row.get::<_, String>(6)?),
    })
}

const TRADE_COLS: &str = "id, session_id, buyer_name, seller_name, price, quantity, created_at";

fn trader_state_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TraderStateRow> {
    Ok(TraderStateRow {
        id: row.get(0)?,
        session_id: row.get(1)?,
        name: row.get(2)?,
        trader_type: TraderType::parse(&row.get::<_, String>(3)?).unwrap_or(TraderType::Noise),
        position: row.get(4)?,
        cash: row.get(5)?,
        pnl: row.get(6)?,
        system_prompt: row.get(7)?,
        updated_at: ts_from_sql(&row.get::<_, String>(8)?),
    })
}

const TRADER_STATE_COLS: &str =
    "id, session_id, name, trader_type, position, cash, pnl, system_prompt, updated_at";

/// Row CRUD over one sqlite connection. Cheap to clone; all writers share
/// the connection behind an async mutex so a lock may be held across await
/// points without blocking the runtime.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open session db")?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory db")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("enable foreign keys")?;
        conn.execute_batch(SCHEMA_SQL).context("create schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` inside one immediate (write-locking) transaction. The
    /// matching engine's cancel-place-match sections go through here.
    pub async fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("begin immediate")?;
        let out = f(&tx)?;
        tx.commit().context("commit")?;
        Ok(out)
    }

    // -- sessions -----------------------------------------------------------

    pub async fn insert_session(&self, row: &SessionRow) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.prepare_cached(
            "INSERT INTO sessions (id, question_text, question_type, status, current_phase, \
             tokens_used, error_message, created_at, started_at, completed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?
        .execute(params![
            row.id,
            row.question_text,
            row.question_type.as_str(),
            row.status.as_str(),
            row.current_phase.as_str(),
            row.tokens_used,
            row.error_message,
            ts_to_sql(&row.created_at),
            row.started_at.as_ref().map(ts_to_sql),
            row.completed_at.as_ref().map(ts_to_sql),
        ])?;
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<SessionRow>> {
        let conn = self.conn.lock().await;
        let row = conn
            .prepare_cached(&format!("SELECT {SESSION_COLS} FROM sessions WHERE id = ?1"))?
            .query_row(params![id], session_from_row)
            .optional()?;
        Ok(row)
    }

    pub async fn list_sessions(
        &self,
        limit: usize,
        offset: usize,
        question_like: Option<&str>,
    ) -> Result<(Vec<SessionRow>, i64)> {
        let conn = self.conn.lock().await;
        let (rows, total) = match question_like {
            Some(q) => {
                let pattern = format!("%{}%", q.trim());
                let rows = conn
                    .prepare_cached(&format!(
                        "SELECT {SESSION_COLS} FROM sessions WHERE question_text LIKE ?1 \
                         ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
                    ))?
                    .query_map(params![pattern, limit as i64, offset as i64], session_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                let total: i64 = conn
                    .prepare_cached("SELECT COUNT(*) FROM sessions WHERE question_text LIKE ?1")?
                    .query_row(params![pattern], |r| r.get(0))?;
                (rows, total)
            }
            None => {
                let rows = conn
                    .prepare_cached(&format!(
                        "SELECT {SESSION_COLS} FROM sessions \
                         ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"
                    ))?
                    .query_map(params![limit as i64, offset as i64], session_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                let total: i64 = conn
                    .prepare_cached("SELECT COUNT(*) FROM sessions")?
                    .query_row([], |r| r.get(0))?;
                (rows, total)
            }
        };
        Ok((rows, total))
    }

    /// Dedup key for idempotent session runs: an active session with the
    /// same trimmed question created inside the window.
    pub async fn find_recent_active_session(
        &self,
        question_text: &str,
        window_secs: i64,
    ) -> Result<Option<String>> {
        let cutoff = ts_to_sql(&(Utc::now() - chrono::Duration::seconds(window_secs)));
        let conn = self.conn.lock().await;
        let id = conn
            .prepare_cached(
                "SELECT id FROM sessions \
                 WHERE status = 'running' AND question_text = ?1 AND created_at >= ?2 \
                 ORDER BY created_at DESC LIMIT 1",
            )?
            .query_row(params![question_text.trim(), cutoff], |r| r.get(0))
            .optional()?;
        Ok(id)
    }

    pub async fn set_session_phase(&self, id: &str, phase: SessionPhase) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.prepare_cached("UPDATE sessions SET current_phase = ?2 WHERE id = ?1")?
            .execute(params![id, phase.as_str()])?;
        Ok(())
    }

    pub async fn mark_session_started(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.prepare_cached(
            "UPDATE sessions SET started_at = ?2 WHERE id = ?1 AND started_at IS NULL",
        )?
        .execute(params![id, ts_to_sql(&Utc::now())])?;
        Ok(())
    }

    /// Terminal statuses also stamp `completed_at`.
    pub async fn set_session_status(
        &self,
        id: &str,
        status: SessionStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        if status.is_terminal() {
            conn.prepare_cached(
                "UPDATE sessions SET status = ?2, error_message = ?3, completed_at = ?4 \
                 WHERE id = ?1",
            )?
            .execute(params![id, status.as_str(), error, ts_to_sql(&Utc::now())])?;
        } else {
            conn.prepare_cached("UPDATE sessions SET status = ?2, error_message = ?3 WHERE id = ?1")?
                .execute(params![id, status.as_str(), error])?;
        }
        Ok(())
    }

    pub async fn add_session_tokens(&self, id: &str, tokens: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.prepare_cached("UPDATE sessions SET tokens_used = tokens_used + ?2 WHERE id = ?1")?
            .execute(params![id, tokens])?;
        Ok(())
    }

    // -- agent logs ---------------------------------------------------------

    pub async fn insert_agent_log(&self, row: &AgentLogRow) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.prepare_cached(
            "INSERT INTO agent_logs (id, session_id, agent_name, phase, status, output_data, \
             error_message, tokens_used, created_at, completed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?
        .execute(params![
            row.id,
            row.session_id,
            row.agent_name,
            row.phase.as_str(),
            row.status.as_str(),
            row.output_data.as_ref().map(|v| v.to_string()),
            row.error_message,
            row.tokens_used,
            ts_to_sql(&row.created_at),
            row.completed_at.as_ref().map(ts_to_sql),
        ])?;
        Ok(())
    }

    /// Apply the single terminal transition of an agent log. The guard on
    /// the current status makes a second transition a no-op, which keeps
    /// timeout/cancel races from double-writing.
    pub async fn finish_agent_log(
        &self,
        id: &str,
        status: WorkerStatus,
        output: Option<&serde_json::Value>,
        error: Option<&str>,
        tokens: i64,
    ) -> Result<Option<AgentLogRow>> {
        let conn = self.conn.lock().await;
        let changed = conn
            .prepare_cached(
                "UPDATE agent_logs SET status = ?2, output_data = ?3, error_message = ?4, \
                 tokens_used = ?5, completed_at = ?6 \
                 WHERE id = ?1 AND status = 'running'",
            )?
            .execute(params![
                id,
                status.as_str(),
                output.map(|v| v.to_string()),
                error,
                tokens,
                ts_to_sql(&Utc::now()),
            ])?;
        if changed == 0 {
            return Ok(None);
        }
        let row = conn
            .prepare_cached(&format!("SELECT {AGENT_LOG_COLS} FROM agent_logs WHERE id = ?1"))?
            .query_row(params![id], agent_log_from_row)
            .optional()?;
        Ok(row)
    }

    pub async fn list_agent_logs(&self, session_id: &str) -> Result<Vec<AgentLogRow>> {
        let conn = self.conn.lock().await;
        let rows = conn
            .prepare_cached(&format!(
                "SELECT {AGENT_LOG_COLS} FROM agent_logs WHERE session_id = ?1 \
                 ORDER BY created_at ASC, agent_name ASC"
            ))?
            .query_map(params![session_id], agent_log_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // -- factors ------------------------------------------------------------

    pub async fn upsert_factor(&self, row: &FactorRow) -> Result<FactorRow> {
        let normalized = normalize_factor_name(&row.name);
        let conn = self.conn.lock().await;
        conn.prepare_cached(
            "INSERT INTO factors (id, session_id, name, normalized_name, description, category, \
             importance_score, research_summary) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(session_id, normalized_name) DO UPDATE SET \
                name = excluded.name, \
                description = excluded.description, \
                category = excluded.category",
        )?
        .execute(params![
            row.id,
            row.session_id,
            row.name,
            normalized,
            row.description,
            row.category,
            row.importance_score,
            row.research_summary,
        ])?;
        let stored = conn
            .prepare_cached(&format!(
                "SELECT {FACTOR_COLS} FROM factors \
                 WHERE session_id = ?1 AND normalized_name = ?2"
            ))?
            .query_row(params![row.session_id, normalized], factor_from_row)?;
        Ok(stored)
    }

    pub async fn set_factor_score(
        &self,
        session_id: &str,
        name: &str,
        score: f64,
    ) -> Result<Option<FactorRow>> {
        let normalized = normalize_factor_name(name);
        let conn = self.conn.lock().await;
        conn.prepare_cached(
            "UPDATE factors SET importance_score = ?3 \
             WHERE session_id = ?1 AND normalized_name = ?2",
        )?
        .execute(params![session_id, normalized, score])?;
        let row = conn
            .prepare_cached(&format!(
                "SELECT {FACTOR_COLS} FROM factors \
                 WHERE session_id = ?1 AND normalized_name = ?2"
            ))?
            .query_row(params![session_id, normalized], factor_from_row)
            .optional()?;
        Ok(row)
    }

    pub async fn set_factor_summary(
        &self,
        session_id: &str,
        name: &str,
        summary: &str,
    ) -> Result<Option<FactorRow>> {
        let normalized = normalize_factor_name(name);
        let conn = self.conn.lock().await;
        conn.prepare_cached(
            "UPDATE factors SET research_summary = ?3 \
             WHERE session_id = ?1 AND normalized_name = ?2",
        )?
        .execute(params![session_id, normalized, summary])?;
        let row = conn
            .prepare_cached(&format!(
                "SELECT {FACTOR_COLS} FROM factors \
                 WHERE session_id = ?1 AND normalized_name = ?2"
            ))?
            .query_row(params![session_id, normalized], factor_from_row)
            .optional()?;
        Ok(row)
    }

    pub async fn list_factors(&self, session_id: &str) -> Result<Vec<FactorRow>> {
        let conn = self.conn.lock().await;
        let rows = conn
            .prepare_cached(&format!(
                "SELECT {FACTOR_COLS} FROM factors WHERE session_id = ?1 \
                 ORDER BY importance_score DESC, name ASC"
            ))?
            .query_map(params![session_id], factor_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // -- forecaster responses -----------------------------------------------

    pub async fn insert_forecaster_response(&self, row: &ForecasterResponseRow) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.prepare_cached(
            "INSERT INTO forecaster_responses (id, session_id, forecaster_class, \
             prediction_probability, confidence, reasoning, key_factors, phase_durations, \
             status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?
        .execute(params![
            row.id,
            row.session_id,
            row.forecaster_class.as_str(),
            row.prediction_probability,
            row.confidence,
            row.reasoning,
            serde_json::to_string(&row.key_factors).unwrap_or_else(|_| "[]".to_string()),
            row.phase_durations
                .as_ref()
                .and_then(|d| serde_json::to_string(d).ok()),
            row.status.as_str(),
            ts_to_sql(&row.created_at),
        ])?;
        Ok(())
    }

    pub async fn list_forecaster_responses(
        &self,
        session_id: &str,
    ) -> Result<Vec<ForecasterResponseRow>> {
        let conn = self.conn.lock().await;
        let rows = conn
            .prepare_cached(&format!(
                "SELECT {RESPONSE_COLS} FROM forecaster_responses WHERE session_id = ?1 \
                 ORDER BY forecaster_class ASC"
            ))?
            .query_map(params![session_id], response_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // -- read side of the market --------------------------------------------

    pub async fn get_order(&self, id: &str) -> Result<Option<OrderRow>> {
        let conn = self.conn.lock().await;
        let row = conn
            .prepare_cached(&format!("SELECT {ORDER_COLS} FROM orders WHERE id = ?1"))?
            .query_row(params![id], order_from_row)
            .optional()?;
        Ok(row)
    }

    pub async fn list_orders(&self, session_id: &str) -> Result<Vec<OrderRow>> {
        let conn = self.conn.lock().await;
        let rows = conn
            .prepare_cached(&format!(
                "SELECT {ORDER_COLS} FROM orders WHERE session_id = ?1 ORDER BY seq ASC"
            ))?
            .query_map(params![session_id], order_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn list_trades(&self, session_id: &str, limit: usize) -> Result<Vec<TradeRow>> {
        let conn = self.conn.lock().await;
        let rows = conn
            .prepare_cached(&format!(
                "SELECT {TRADE_COLS} FROM trades WHERE session_id = ?1 \
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
            ))?
            .query_map(params![session_id, limit as i64], trade_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Last trade price and total traded volume for a session.
    pub async fn trade_stats(&self, session_id: &str) -> Result<(Option<i64>, i64)> {
        let conn = self.conn.lock().await;
        let last_price: Option<i64> = conn
            .prepare_cached(
                "SELECT price FROM trades WHERE session_id = ?1 \
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
            )?
            .query_row(params![session_id], |r| r.get(0))
            .optional()?;
        let volume: i64 = conn
            .prepare_cached("SELECT COALESCE(SUM(quantity), 0) FROM trades WHERE session_id = ?1")?
            .query_row(params![session_id], |r| r.get(0))?;
        Ok((last_price, volume))
    }

    pub async fn list_trader_states(&self, session_id: &str) -> Result<Vec<TraderStateRow>> {
        let conn = self.conn.lock().await;
        let rows = conn
            .prepare_cached(&format!(
                "SELECT {TRADER_STATE_COLS} FROM trader_state WHERE session_id = ?1 \
                 ORDER BY name ASC"
            ))?
            .query_map(params![session_id], trader_state_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Seed a trader row if absent (round scheduler start-of-session).
    pub async fn seed_trader_state(&self, row: &TraderStateRow) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.prepare_cached(
            "INSERT INTO trader_state (id, session_id, name, trader_type, position, cash, pnl, \
             system_prompt, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(session_id, name) DO UPDATE SET \
                system_prompt = excluded.system_prompt",
        )?
        .execute(params![
            row.id,
            row.session_id,
            row.name,
            row.trader_type.as_str(),
            row.position,
            row.cash,
            row.pnl,
            row.system_prompt,
            ts_to_sql(&row.updated_at),
        ])?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transaction-scoped order book operations
//
// The matching engine calls these inside `Store::with_tx` so one
// cancel-place-match section is a single isolated transaction.
// ---------------------------------------------------------------------------

pub fn tx_next_seq(tx: &Transaction<'_>, session_id: &str) -> Result<i64> {
    let seq: i64 = tx
        .prepare_cached("SELECT COALESCE(MAX(seq), 0) + 1 FROM orders WHERE session_id = ?1")?
        .query_row(params![session_id], |r| r.get(0))?;
    Ok(seq)
}

pub fn tx_insert_order(tx: &Transaction<'_>, row: &OrderRow) -> Result<()> {
    tx.prepare_cached(
        "INSERT INTO orders (id, session_id, trader_name, side, price, quantity, \
         filled_quantity, status, seq, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?
    .execute(params![
        row.id,
        row.session_id,
        row.trader_name,
        row.side.as_str(),
        row.price,
        row.quantity,
        row.filled_quantity,
        row.status.as_str(),
        row.seq,
        ts_to_sql(&row.created_at),
    ])?;
    Ok(())
}

pub fn tx_cancel_trader_orders(
    tx: &Transaction<'_>,
    session_id: &str,
    trader_name: &str,
) -> Result<usize> {
    let n = tx
        .prepare_cached(
            "UPDATE orders SET status = 'cancelled' \
             WHERE session_id = ?1 AND trader_name = ?2 \
               AND status IN ('open', 'partially_filled')",
        )?
        .execute(params![session_id, trader_name])?;
    Ok(n)
}

/// Best active bid: highest price, earliest arrival.
pub fn tx_best_bid(tx: &Transaction<'_>, session_id: &str) -> Result<Option<OrderRow>> {
    let row = tx
        .prepare_cached(&format!(
            "SELECT {ORDER_COLS} FROM orders \
             WHERE session_id = ?1 AND side = 'buy' \
               AND status IN ('open', 'partially_filled') AND filled_quantity < quantity \
             ORDER BY price DESC, seq ASC LIMIT 1"
        ))?
        .query_row(params![session_id], order_from_row)
        .optional()?;
    Ok(row)
}

/// Best active ask at or below the bid price, excluding the bidder's own
/// quotes (self-match prohibition): lowest price, earliest arrival.
pub fn tx_best_matchable_ask(
    tx: &Transaction<'_>,
    session_id: &str,
    max_price: i64,
    exclude_trader: &str,
) -> Result<Option<OrderRow>> {
    let row = tx
        .prepare_cached(&format!(
            "SELECT {ORDER_COLS} FROM orders \
             WHERE session_id = ?1 AND side = 'sell' \
               AND status IN ('open', 'partially_filled') AND filled_quantity < quantity \
               AND price <= ?2 AND trader_name != ?3 \
             ORDER BY price ASC, seq ASC LIMIT 1"
        ))?
        .query_row(params![session_id, max_price, exclude_trader], order_from_row)
        .optional()?;
    Ok(row)
}

pub fn tx_apply_fill_to_order(tx: &Transaction<'_>, order_id: &str, fill: i64) -> Result<()> {
    tx.prepare_cached(
        "UPDATE orders SET \
            filled_quantity = filled_quantity + ?2, \
            status = CASE WHEN filled_quantity + ?2 >= quantity \
                          THEN 'filled' ELSE 'partially_filled' END \
         WHERE id = ?1",
    )?
    .execute(params![order_id, fill])?;
    Ok(())
}

pub fn tx_insert_trade(tx: &Transaction<'_>, row: &TradeRow) -> Result<()> {
    tx.prepare_cached(
        "INSERT INTO trades (id, session_id, buyer_name, seller_name, price, quantity, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?
    .execute(params![
        row.id,
        row.session_id,
        row.buyer_name,
        row.seller_name,
        row.price,
        row.quantity,
        ts_to_sql(&row.created_at),
    ])?;
    Ok(())
}

/// Apply a position/cash delta to a trader, creating the row on first
/// fill. `pnl` is re-marked against the fill price.
pub fn tx_apply_trader_delta(
    tx: &Transaction<'_>,
    session_id: &str,
    name: &str,
    position_delta: i64,
    cash_delta: f64,
    mark_price: i64,
) -> Result<()> {
    let now = ts_to_sql(&Utc::now());
    tx.prepare_cached(
        "INSERT INTO trader_state (id, session_id, name, trader_type, position, cash, pnl, \
         system_prompt, updated_at) \
         VALUES (?1, ?2, ?3, ?4, 0, 0, 0, NULL, ?5) \
         ON CONFLICT(session_id, name) DO NOTHING",
    )?
    .execute(params![
        uuid::Uuid::new_v4().to_string(),
        session_id,
        name,
        crate::models::trader_type_of(name).as_str(),
        now,
    ])?;
    tx.prepare_cached(
        "UPDATE trader_state SET \
            position = position + ?3, \
            cash = cash + ?4, \
            pnl = cash + ?4 + (position + ?3) * ?5 / 100.0, \
            updated_at = ?6 \
         WHERE session_id = ?1 AND name = ?2",
    )?
    .execute(params![
        session_id,
        name,
        position_delta,
        cash_delta,
        mark_price as f64,
        now,
    ])?;
    Ok(())
}

pub fn tx_get_trader_state(
    tx: &Transaction<'_>,
    session_id: &str,
    name: &str,
) -> Result<Option<TraderStateRow>> {
    let row = tx
        .prepare_cached(&format!(
            "SELECT {TRADER_STATE_COLS} FROM trader_state \
             WHERE session_id = ?1 AND name = ?2"
        ))?
        .query_row(params![session_id, name], trader_state_from_row)
        .optional()?;
    Ok(row)
}
