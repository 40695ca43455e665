//! Continuous double-auction market: the price-time-priority matching
//! engine, the atomic market-making primitive, and orderbook snapshots.

pub mod book;
pub mod engine;

pub use book::{BookLevel, MarketSnapshot, OrderbookSnapshot};
pub use engine::{MatchSummary, MatchingEngine, MmQuoteResult};
