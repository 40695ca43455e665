//! Read-side views of a session's order book.
//!
//! Snapshots aggregate the active orders into price levels for the API and
//! give traders the compact market picture a decision needs. Snapshots are
//! plain reads; they never touch the matching lock.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::{OrderStatus, Side};
use crate::store::Store;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BookLevel {
    pub price: i64,
    pub quantity: i64,
    pub order_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderbookSnapshot {
    /// Best (highest) bid first.
    pub bids: Vec<BookLevel>,
    /// Best (lowest) ask first.
    pub asks: Vec<BookLevel>,
    pub last_price: Option<i64>,
    pub volume: i64,
}

/// The pre-round market picture a trader decides from.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketSnapshot {
    pub best_bid: Option<i64>,
    pub best_ask: Option<i64>,
    pub last_price: Option<i64>,
    pub volume: i64,
}

impl MarketSnapshot {
    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) as f64 / 2.0),
            _ => None,
        }
    }

    /// Best available price anchor: mid, then last trade, then none.
    pub fn anchor_price(&self) -> Option<f64> {
        self.mid_price().or(self.last_price.map(|p| p as f64))
    }
}

pub async fn orderbook_snapshot(store: &Store, session_id: &str) -> Result<OrderbookSnapshot> {
    let orders = store.list_orders(session_id).await?;
    let (last_price, volume) = store.trade_stats(session_id).await?;

    let mut bid_levels: BTreeMap<i64, BookLevel> = BTreeMap::new();
    let mut ask_levels: BTreeMap<i64, BookLevel> = BTreeMap::new();
    for order in orders {
        let active = matches!(
            order.status,
            OrderStatus::Open | OrderStatus::PartiallyFilled
        ) && order.remaining() > 0;
        if !active {
            continue;
        }
        let levels = match order.side {
            Side::Buy => &mut bid_levels,
            Side::Sell => &mut ask_levels,
        };
        let level = levels.entry(order.price).or_insert(BookLevel {
            price: order.price,
            quantity: 0,
            order_count: 0,
        });
        level.quantity += order.remaining();
        level.order_count += 1;
    }

    Ok(OrderbookSnapshot {
        bids: bid_levels.into_values().rev().collect(),
        asks: ask_levels.into_values().collect(),
        last_price,
        volume,
    })
}

pub async fn market_snapshot(store: &Store, session_id: &str) -> Result<MarketSnapshot> {
    let book = orderbook_snapshot(store, session_id).await?;
    Ok(MarketSnapshot {
        best_bid: book.bids.first().map(|l| l.price),
        best_ask: book.asks.first().map(|l| l.price),
        last_price: book.last_price,
        volume: book.volume,
    })
}
