//! Price-time-priority matching engine.
//!
//! All order mutation for a session happens inside one immediate sqlite
//! transaction guarded by a session-keyed async mutex, so concurrent
//! market-making calls against the same session serialize while distinct
//! sessions proceed independently. The book itself lives in the orders
//! table; this module owns every write to order fill state, trades and
//! trader position/cash.

use anyhow::{bail, Result};
use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use rusqlite::Transaction;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;
use uuid::Uuid;

use crate::models::{LiveEvent, OrderRow, OrderStatus, Side, TradeRow};
use crate::store::db::{
    tx_apply_fill_to_order, tx_apply_trader_delta, tx_best_bid, tx_best_matchable_ask,
    tx_cancel_trader_orders, tx_insert_order, tx_insert_trade, tx_next_seq,
};
use crate::store::{Broadcaster, Store};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchSummary {
    pub trades_count: u64,
    pub total_volume: i64,
}

/// Result of the atomic cancel-place-match primitive.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MmQuoteResult {
    pub cancelled: usize,
    pub bid_id: String,
    pub ask_id: String,
    pub trades_count: u64,
    pub volume: i64,
}

#[derive(Clone)]
pub struct MatchingEngine {
    store: Store,
    broadcaster: Broadcaster,
    session_locks: Arc<SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl MatchingEngine {
    pub fn new(store: Store, broadcaster: Broadcaster) -> Self {
        Self {
            store,
            broadcaster,
            session_locks: Arc::new(SyncMutex::new(HashMap::new())),
        }
    }

    /// The serializing lock for one session's book.
    fn session_lock(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        self.session_locks
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Place a single limit order and match to fixpoint. Returns the order
    /// as stored after matching plus the match summary.
    pub async fn submit_order(
        &self,
        session_id: &str,
        trader_name: &str,
        side: Side,
        price: i64,
        quantity: i64,
    ) -> Result<(OrderRow, MatchSummary)> {
        validate_order(price, quantity)?;
        if trader_name.trim().is_empty() {
            bail!("trader_name required");
        }

        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let session = session_id.to_string();
        let trader = trader_name.to_string();
        let (order_id, summary, trades) = self
            .store
            .with_tx(move |tx| {
                let seq = tx_next_seq(tx, &session)?;
                let order = OrderRow {
                    id: Uuid::new_v4().to_string(),
                    session_id: session.clone(),
                    trader_name: trader,
                    side,
                    price,
                    quantity,
                    filled_quantity: 0,
                    status: OrderStatus::Open,
                    seq,
                    created_at: Utc::now(),
                };
                tx_insert_order(tx, &order)?;
                let (summary, trades) = match_to_fixpoint(tx, &session)?;
                Ok((order.id, summary, trades))
            })
            .await?;

        self.publish_match_results(session_id, &trades).await;

        let stored = self
            .store
            .get_order(&order_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("order {order_id} vanished"))?;
        Ok((stored, summary))
    }

    /// Atomic market-making replace: cancel every active order of the
    /// trader, post a fresh bid/ask pair, then match to fixpoint. The whole
    /// section is one isolated transaction under the session lock, so no
    /// peer can trade against the old quotes after cancellation or observe
    /// the book between placement and matching.
    pub async fn place_mm_quotes(
        &self,
        session_id: &str,
        trader_name: &str,
        bid_price: i64,
        ask_price: i64,
        quantity: i64,
    ) -> Result<MmQuoteResult> {
        validate_mm_quotes(bid_price, ask_price, quantity)?;
        if trader_name.trim().is_empty() {
            bail!("trader_name required");
        }

        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;

        let session = session_id.to_string();
        let trader = trader_name.to_string();
        let (result, trades) = self
            .store
            .with_tx(move |tx| {
                let cancelled = tx_cancel_trader_orders(tx, &session, &trader)?;

                let now = Utc::now();
                let bid = OrderRow {
                    id: Uuid::new_v4().to_string(),
                    session_id: session.clone(),
                    trader_name: trader.clone(),
                    side: Side::Buy,
                    price: bid_price,
                    quantity,
                    filled_quantity: 0,
                    status: OrderStatus::Open,
                    seq: tx_next_seq(tx, &session)?,
                    created_at: now,
                };
                tx_insert_order(tx, &bid)?;
                let ask = OrderRow {
                    id: Uuid::new_v4().to_string(),
                    session_id: session.clone(),
                    trader_name: trader.clone(),
                    side: Side::Sell,
                    price: ask_price,
                    quantity,
                    filled_quantity: 0,
                    status: OrderStatus::Open,
                    seq: tx_next_seq(tx, &session)?,
                    created_at: now,
                };
                tx_insert_order(tx, &ask)?;

                let (summary, trades) = match_to_fixpoint(tx, &session)?;
                Ok((
                    MmQuoteResult {
                        cancelled,
                        bid_id: bid.id,
                        ask_id: ask.id,
                        trades_count: summary.trades_count,
                        volume: summary.total_volume,
                    },
                    trades,
                ))
            })
            .await?;

        metrics::increment_counter!("mm_quote_replacements_total");
        self.publish_match_results(session_id, &trades).await;
        Ok(result)
    }

    /// Mirror post-commit effects onto the broadcast channels.
    async fn publish_match_results(&self, session_id: &str, trades: &[TradeRow]) {
        for trade in trades {
            self.broadcaster.publish(LiveEvent::Trades(trade.clone()));
        }
        if !trades.is_empty() {
            if let Ok(states) = self.store.list_trader_states(session_id).await {
                let touched: std::collections::HashSet<&str> = trades
                    .iter()
                    .flat_map(|t| [t.buyer_name.as_str(), t.seller_name.as_str()])
                    .collect();
                for state in states {
                    if touched.contains(state.name.as_str()) {
                        self.broadcaster.publish(LiveEvent::TraderStateLive(state));
                    }
                }
            }
        }
        self.broadcaster.publish(LiveEvent::OrderbookLive {
            session_id: session_id.to_string(),
        });
    }
}

fn validate_order(price: i64, quantity: i64) -> Result<()> {
    if !(0..=100).contains(&price) {
        bail!("price must be in 0..=100 cents, got {price}");
    }
    if quantity < 1 {
        bail!("quantity must be >= 1, got {quantity}");
    }
    Ok(())
}

fn validate_mm_quotes(bid_price: i64, ask_price: i64, quantity: i64) -> Result<()> {
    validate_order(bid_price, quantity)?;
    validate_order(ask_price, quantity)?;
    if bid_price > ask_price {
        bail!("bid {bid_price} must not exceed ask {ask_price}");
    }
    Ok(())
}

/// Run the matching loop until no crossing pair remains.
///
/// Each iteration takes the best active bid, then the best active ask at
/// or below it from a different trader (self-match prohibition means the
/// bidder's own asks are skipped, not cancelled). The fill executes at the
/// ask's price and both sides' trader state moves inside the same
/// transaction, which keeps position and cash conservation exact.
fn match_to_fixpoint(
    tx: &Transaction<'_>,
    session_id: &str,
) -> Result<(MatchSummary, Vec<TradeRow>)> {
    let mut trades = Vec::new();
    let mut total_volume = 0i64;

    loop {
        let Some(bid) = tx_best_bid(tx, session_id)? else {
            break;
        };
        let Some(ask) = tx_best_matchable_ask(tx, session_id, bid.price, &bid.trader_name)? else {
            break;
        };

        let fill = bid.remaining().min(ask.remaining());
        debug_assert!(fill >= 1);
        let exec_price = ask.price;

        let trade = TradeRow {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            buyer_name: bid.trader_name.clone(),
            seller_name: ask.trader_name.clone(),
            price: exec_price,
            quantity: fill,
            created_at: Utc::now(),
        };
        tx_insert_trade(tx, &trade)?;
        tx_apply_fill_to_order(tx, &bid.id, fill)?;
        tx_apply_fill_to_order(tx, &ask.id, fill)?;

        let cash = exec_price as f64 * fill as f64 / 100.0;
        tx_apply_trader_delta(tx, session_id, &bid.trader_name, fill, -cash, exec_price)?;
        tx_apply_trader_delta(tx, session_id, &ask.trader_name, -fill, cash, exec_price)?;

        debug!(
            session_id,
            buyer = %trade.buyer_name,
            seller = %trade.seller_name,
            price = exec_price,
            quantity = fill,
            "Trade executed"
        );
        total_volume += fill;
        trades.push(trade);
    }

    metrics::counter!("trades_matched_total", trades.len() as u64);
    Ok((
        MatchSummary {
            trades_count: trades.len() as u64,
            total_volume,
        },
        trades,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{QuestionType, SessionPhase, SessionRow, SessionStatus};

    async fn setup() -> (Store, MatchingEngine, String) {
        let store = Store::in_memory().unwrap();
        let engine = MatchingEngine::new(store.clone(), Broadcaster::new());
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
        (store, engine, session_id)
    }

    #[tokio::test]
    async fn price_time_priority_earliest_ask_first() {
        let (store, engine, session) = setup().await;

        engine
            .submit_order(&session, "trader_A", Side::Sell, 60, 10)
            .await
            .unwrap();
        engine
            .submit_order(&session, "trader_B", Side::Sell, 60, 10)
            .await
            .unwrap();
        let (buy, summary) = engine
            .submit_order(&session, "trader_C", Side::Buy, 70, 15)
            .await
            .unwrap();

        assert_eq!(summary.trades_count, 2);
        assert_eq!(summary.total_volume, 15);
        assert_eq!(buy.status, OrderStatus::Filled);

        let trades = store.list_trades(&session, 10).await.unwrap();
        let mut trades = trades;
        trades.reverse();
        assert_eq!(trades[0].seller_name, "trader_A");
        assert_eq!(trades[0].quantity, 10);
        assert_eq!(trades[0].price, 60);
        assert_eq!(trades[1].seller_name, "trader_B");
        assert_eq!(trades[1].quantity, 5);
        assert_eq!(trades[1].price, 60);

        let orders = store.list_orders(&session).await.unwrap();
        let b_ask = orders
            .iter()
            .find(|o| o.trader_name == "trader_B" && o.side == Side::Sell)
            .unwrap();
        assert_eq!(b_ask.status, OrderStatus::PartiallyFilled);
        assert_eq!(b_ask.remaining(), 5);
    }

    #[tokio::test]
    async fn self_match_is_skipped() {
        let (store, engine, session) = setup().await;

        engine
            .submit_order(&session, "trader_A", Side::Sell, 50, 5)
            .await
            .unwrap();
        let (_, summary) = engine
            .submit_order(&session, "trader_A", Side::Buy, 50, 5)
            .await
            .unwrap();

        assert_eq!(summary.trades_count, 0);
        let orders = store.list_orders(&session).await.unwrap();
        assert_eq!(orders.len(), 2);
        assert!(orders.iter().all(|o| o.status == OrderStatus::Open));
        assert!(orders.iter().all(|o| o.filled_quantity == 0));
    }

    #[tokio::test]
    async fn self_match_picks_next_eligible_ask() {
        let (store, engine, session) = setup().await;

        // A's own ask is the best price but must be skipped in favor of B's.
        engine
            .submit_order(&session, "trader_A", Side::Sell, 50, 5)
            .await
            .unwrap();
        engine
            .submit_order(&session, "trader_B", Side::Sell, 55, 5)
            .await
            .unwrap();
        let (_, summary) = engine
            .submit_order(&session, "trader_A", Side::Buy, 60, 5)
            .await
            .unwrap();

        assert_eq!(summary.trades_count, 1);
        let trades = store.list_trades(&session, 10).await.unwrap();
        assert_eq!(trades[0].seller_name, "trader_B");
        assert_eq!(trades[0].price, 55);
    }

    #[tokio::test]
    async fn mm_replace_is_atomic() {
        let (store, engine, session) = setup().await;

        // Standing quotes for A plus a resting ask from B at 55.
        engine
            .submit_order(&session, "trader_A", Side::Buy, 40, 10)
            .await
            .unwrap();
        engine
            .submit_order(&session, "trader_A", Side::Sell, 60, 10)
            .await
            .unwrap();
        engine
            .submit_order(&session, "trader_B", Side::Sell, 55, 10)
            .await
            .unwrap();

        let result = engine
            .place_mm_quotes(&session, "trader_A", 56, 58, 10)
            .await
            .unwrap();

        assert_eq!(result.cancelled, 2);
        assert_eq!(result.trades_count, 1);
        assert_eq!(result.volume, 10);

        let trades = store.list_trades(&session, 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].buyer_name, "trader_A");
        assert_eq!(trades[0].seller_name, "trader_B");
        assert_eq!(trades[0].price, 55);
        assert_eq!(trades[0].quantity, 10);

        let new_bid = store.get_order(&result.bid_id).await.unwrap().unwrap();
        assert_eq!(new_bid.status, OrderStatus::Filled);
        let new_ask = store.get_order(&result.ask_id).await.unwrap().unwrap();
        assert_eq!(new_ask.status, OrderStatus::Open);

        let orders = store.list_orders(&session).await.unwrap();
        let cancelled = orders
            .iter()
            .filter(|o| o.status == OrderStatus::Cancelled)
            .count();
        assert_eq!(cancelled, 2);
    }

    #[tokio::test]
    async fn equal_prices_trade_at_boundary() {
        let (store, engine, session) = setup().await;

        engine
            .submit_order(&session, "trader_A", Side::Sell, 100, 1)
            .await
            .unwrap();
        let (_, summary) = engine
            .submit_order(&session, "trader_B", Side::Buy, 100, 1)
            .await
            .unwrap();
        assert_eq!(summary.trades_count, 1);
        let trades = store.list_trades(&session, 10).await.unwrap();
        assert_eq!(trades[0].price, 100);
    }

    #[tokio::test]
    async fn zero_bid_rests_indefinitely() {
        let (store, engine, session) = setup().await;

        let (order, summary) = engine
            .submit_order(&session, "trader_A", Side::Buy, 0, 3)
            .await
            .unwrap();
        assert_eq!(summary.trades_count, 0);
        assert_eq!(order.status, OrderStatus::Open);

        engine
            .submit_order(&session, "trader_B", Side::Sell, 1, 3)
            .await
            .unwrap();
        let orders = store.list_orders(&session).await.unwrap();
        assert!(orders.iter().all(|o| o.filled_quantity == 0));

        // An ask at 0 finally crosses it.
        let (_, summary) = engine
            .submit_order(&session, "trader_B", Side::Sell, 0, 3)
            .await
            .unwrap();
        assert_eq!(summary.trades_count, 1);
        let trades = store.list_trades(&session, 10).await.unwrap();
        assert_eq!(trades[0].price, 0);
    }

    #[tokio::test]
    async fn placement_validation_rejects_bad_orders() {
        let (_, engine, session) = setup().await;

        assert!(engine
            .submit_order(&session, "t", Side::Buy, 101, 1)
            .await
            .is_err());
        assert!(engine
            .submit_order(&session, "t", Side::Buy, -1, 1)
            .await
            .is_err());
        assert!(engine
            .submit_order(&session, "t", Side::Buy, 50, 0)
            .await
            .is_err());
        assert!(engine.place_mm_quotes(&session, "t", 60, 40, 1).await.is_err());
        assert!(engine.place_mm_quotes(&session, "t", 40, 60, 0).await.is_err());
    }

    #[tokio::test]
    async fn position_and_cash_conserve_per_trade() {
        let (store, engine, session) = setup().await;

        engine
            .submit_order(&session, "trader_A", Side::Sell, 45, 7)
            .await
            .unwrap();
        engine
            .submit_order(&session, "trader_B", Side::Buy, 45, 7)
            .await
            .unwrap();

        let states = store.list_trader_states(&session).await.unwrap();
        assert_eq!(states.len(), 2);
        let position_sum: i64 = states.iter().map(|s| s.position).sum();
        let cash_sum: f64 = states.iter().map(|s| s.cash).sum();
        assert_eq!(position_sum, 0);
        assert!(cash_sum.abs() < 1e-9);

        let buyer = states.iter().find(|s| s.name == "trader_B").unwrap();
        assert_eq!(buyer.position, 7);
        assert!((buyer.cash - (-45.0 * 7.0 / 100.0)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn mm_quotes_idempotent_against_empty_peer_book() {
        let (store, engine, session) = setup().await;

        engine
            .place_mm_quotes(&session, "trader_A", 40, 60, 5)
            .await
            .unwrap();
        engine
            .place_mm_quotes(&session, "trader_A", 40, 60, 5)
            .await
            .unwrap();

        let orders = store.list_orders(&session).await.unwrap();
        let active: Vec<_> = orders
            .iter()
            .filter(|o| !o.status.is_terminal())
            .collect();
        assert_eq!(active.len(), 2);
        let bid = active.iter().find(|o| o.side == Side::Buy).unwrap();
        let ask = active.iter().find(|o| o.side == Side::Sell).unwrap();
        assert_eq!((bid.price, bid.quantity), (40, 5));
        assert_eq!((ask.price, ask.quantity), (60, 5));

        let trades = store.list_trades(&session, 10).await.unwrap();
        assert!(trades.is_empty());
    }
}
