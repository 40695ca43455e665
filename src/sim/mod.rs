//! Trading simulation: signal providers, the 18-trader pool, and the
//! round scheduler that drives their repeated quote decisions.

pub mod providers;
pub mod scheduler;
pub mod traders;

pub use providers::{AccountFeedProvider, FeedPost, SentimentProvider, SyntheticFeed, SyntheticSentiment};
pub use scheduler::{RoundScheduler, SimPhase, SimStatus};
pub use traders::{trader_pool, QuoteDecision, TraderContext, TraderSpec};
