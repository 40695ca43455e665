//! The fixed pool of 18 trader identities and their quote logic.
//!
//! Three families share one decision shape: pick a fair value, wrap a
//! spread around it, skew for inventory, clamp to the 0..=100 price grid.
//! Fundamentals anchor on their seeded forecast probability, noise traders
//! ride a sentiment signal, user traders follow a tracked account's stance.

use rand::Rng;

use crate::market::MarketSnapshot;
use crate::models::{ForecasterClass, TraderType, TRADER_IDENTITIES};
use crate::sim::providers::FeedPost;

/// Position size at which a trader's inventory skew saturates.
const MAX_INVENTORY: f64 = 50.0;

/// Neutral prior when nothing has traded and no quotes rest.
const NEUTRAL_PRICE: f64 = 50.0;

#[derive(Debug, Clone)]
pub struct TraderSpec {
    pub name: &'static str,
    pub trader_type: TraderType,
    pub class: Option<ForecasterClass>,
    pub sphere: Option<&'static str>,
    pub handle: Option<&'static str>,
    pub persona: &'static str,
    /// Full spread in cents at neutral inventory.
    pub base_spread: i64,
    pub base_qty: i64,
    /// Weight on the observed market price versus the trader's own belief.
    pub market_weight: f64,
}

/// What a trader sees before quoting: the pre-round snapshot plus its own
/// state and fresh signals.
#[derive(Debug, Clone, Default)]
pub struct TraderContext {
    pub snapshot: MarketSnapshot,
    pub position: i64,
    pub seed_probability: Option<f64>,
    pub sentiment: Option<f64>,
    pub posts: Vec<FeedPost>,
    pub round: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuoteDecision {
    pub bid: i64,
    pub ask: i64,
    pub qty: i64,
}

const POOL: [TraderSpec; 18] = [
    TraderSpec {
        name: "fund_conservative",
        trader_type: TraderType::Fundamental,
        class: Some(ForecasterClass::Conservative),
        sphere: None,
        handle: None,
        persona: "quotes tightly around the conservative forecast and distrusts market swings",
        base_spread: 6,
        base_qty: 10,
        market_weight: 0.15,
    },
    TraderSpec {
        name: "fund_momentum",
        trader_type: TraderType::Fundamental,
        class: Some(ForecasterClass::Momentum),
        sphere: None,
        handle: None,
        persona: "chases the tape, letting the market price pull its quotes along",
        base_spread: 4,
        base_qty: 12,
        market_weight: 0.6,
    },
    TraderSpec {
        name: "fund_historical",
        trader_type: TraderType::Fundamental,
        class: Some(ForecasterClass::Historical),
        sphere: None,
        handle: None,
        persona: "anchors on base rates from the historical forecast",
        base_spread: 6,
        base_qty: 10,
        market_weight: 0.25,
    },
    TraderSpec {
        name: "fund_realtime",
        trader_type: TraderType::Fundamental,
        class: Some(ForecasterClass::Realtime),
        sphere: None,
        handle: None,
        persona: "reprices fast on the freshest forecast",
        base_spread: 4,
        base_qty: 12,
        market_weight: 0.4,
    },
    TraderSpec {
        name: "fund_balanced",
        trader_type: TraderType::Fundamental,
        class: Some(ForecasterClass::Balanced),
        sphere: None,
        handle: None,
        persona: "splits the difference between forecast and market",
        base_spread: 5,
        base_qty: 10,
        market_weight: 0.5,
    },
    TraderSpec {
        name: "sent_tech",
        trader_type: TraderType::Noise,
        class: None,
        sphere: Some("tech"),
        handle: None,
        persona: "trades the technology mood",
        base_spread: 8,
        base_qty: 6,
        market_weight: 1.0,
    },
    TraderSpec {
        name: "sent_politics",
        trader_type: TraderType::Noise,
        class: None,
        sphere: Some("politics"),
        handle: None,
        persona: "trades the political mood",
        base_spread: 8,
        base_qty: 6,
        market_weight: 1.0,
    },
    TraderSpec {
        name: "sent_sports",
        trader_type: TraderType::Noise,
        class: None,
        sphere: Some("sports"),
        handle: None,
        persona: "trades the sports mood",
        base_spread: 10,
        base_qty: 5,
        market_weight: 1.0,
    },
    TraderSpec {
        name: "sent_finance",
        trader_type: TraderType::Noise,
        class: None,
        sphere: Some("finance"),
        handle: None,
        persona: "trades the finance mood",
        base_spread: 7,
        base_qty: 7,
        market_weight: 1.0,
    },
    TraderSpec {
        name: "sent_crypto",
        trader_type: TraderType::Noise,
        class: None,
        sphere: Some("crypto"),
        handle: None,
        persona: "trades the crypto mood, loudly",
        base_spread: 12,
        base_qty: 5,
        market_weight: 1.0,
    },
    TraderSpec {
        name: "sent_science",
        trader_type: TraderType::Noise,
        class: None,
        sphere: Some("science"),
        handle: None,
        persona: "trades the research-community mood",
        base_spread: 9,
        base_qty: 5,
        market_weight: 1.0,
    },
    TraderSpec {
        name: "sent_culture",
        trader_type: TraderType::Noise,
        class: None,
        sphere: Some("culture"),
        handle: None,
        persona: "trades the cultural mood",
        base_spread: 10,
        base_qty: 5,
        market_weight: 1.0,
    },
    TraderSpec {
        name: "sent_energy",
        trader_type: TraderType::Noise,
        class: None,
        sphere: Some("energy"),
        handle: None,
        persona: "trades the energy-sector mood",
        base_spread: 9,
        base_qty: 6,
        market_weight: 1.0,
    },
    TraderSpec {
        name: "sent_health",
        trader_type: TraderType::Noise,
        class: None,
        sphere: Some("health"),
        handle: None,
        persona: "trades the health-sector mood",
        base_spread: 9,
        base_qty: 6,
        market_weight: 1.0,
    },
    TraderSpec {
        name: "track_whalewatch",
        trader_type: TraderType::User,
        class: None,
        sphere: None,
        handle: Some("whalewatch"),
        persona: "mirrors a whale-watching account",
        base_spread: 6,
        base_qty: 8,
        market_weight: 1.0,
    },
    TraderSpec {
        name: "track_newsdesk",
        trader_type: TraderType::User,
        class: None,
        sphere: None,
        handle: Some("newsdesk"),
        persona: "mirrors a breaking-news account",
        base_spread: 7,
        base_qty: 7,
        market_weight: 1.0,
    },
    TraderSpec {
        name: "track_contrarian",
        trader_type: TraderType::User,
        class: None,
        sphere: None,
        handle: Some("contrarian"),
        persona: "fades a loudly contrarian account",
        base_spread: 8,
        base_qty: 6,
        market_weight: 1.0,
    },
    TraderSpec {
        name: "track_quant",
        trader_type: TraderType::User,
        class: None,
        sphere: None,
        handle: Some("quant"),
        persona: "mirrors a quant commentary account",
        base_spread: 5,
        base_qty: 9,
        market_weight: 1.0,
    },
];

pub fn trader_pool() -> &'static [TraderSpec] {
    &POOL
}

impl TraderSpec {
    /// Produce this round's two-sided quote, or nothing when the trader
    /// has no basis to quote.
    pub fn decide(&self, ctx: &TraderContext, rng: &mut impl Rng) -> Option<QuoteDecision> {
        let fair = match self.trader_type {
            TraderType::Fundamental => {
                let belief = ctx.seed_probability? * 100.0;
                let market = ctx.snapshot.anchor_price().unwrap_or(belief);
                self.market_weight * market + (1.0 - self.market_weight) * belief
            }
            TraderType::Noise => {
                let base = ctx.snapshot.anchor_price().unwrap_or(NEUTRAL_PRICE);
                let score = ctx.sentiment.unwrap_or(0.0).clamp(-1.0, 1.0);
                let jitter: f64 = rng.gen_range(-2.0..=2.0);
                base + score * 10.0 + jitter
            }
            TraderType::User => {
                let base = ctx.snapshot.anchor_price().unwrap_or(NEUTRAL_PRICE);
                let stance = if ctx.posts.is_empty() {
                    0.0
                } else {
                    ctx.posts.iter().map(|p| p.stance).sum::<f64>() / ctx.posts.len() as f64
                };
                base + stance.clamp(-1.0, 1.0) * 8.0
            }
        };

        // Long inventory shifts both quotes down, easing the exit side;
        // short inventory mirrors. Skew saturates at MAX_INVENTORY.
        let half = (self.base_spread as f64 / 2.0).max(1.0);
        let inv_fraction = (ctx.position as f64 / MAX_INVENTORY).clamp(-1.0, 1.0);
        let skew = inv_fraction * half;

        let bid = ((fair - half - skew).round() as i64).clamp(0, 100);
        let ask = ((fair + half - skew).round() as i64).clamp(0, 100);
        let (bid, ask) = if bid <= ask { (bid, ask) } else { (ask, bid) };

        Some(QuoteDecision {
            bid,
            ask,
            qty: self.base_qty.max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(42)
    }

    fn spec(name: &str) -> &'static TraderSpec {
        trader_pool().iter().find(|s| s.name == name).unwrap()
    }

    #[test]
    fn pool_matches_identity_table() {
        assert_eq!(trader_pool().len(), TRADER_IDENTITIES.len());
        for (spec, (name, trader_type)) in trader_pool().iter().zip(TRADER_IDENTITIES.iter()) {
            assert_eq!(spec.name, *name);
            assert_eq!(spec.trader_type, *trader_type);
        }
    }

    #[test]
    fn fundamental_straddles_belief_on_empty_book() {
        let ctx = TraderContext {
            seed_probability: Some(0.62),
            ..Default::default()
        };
        let quote = spec("fund_balanced").decide(&ctx, &mut rng()).unwrap();
        assert!(quote.bid < 62 && 62 < quote.ask, "quote {quote:?}");
        assert!(quote.bid <= quote.ask);
        assert!(quote.qty >= 1);
    }

    #[test]
    fn fundamental_without_seed_stays_out() {
        let ctx = TraderContext::default();
        assert!(spec("fund_balanced").decide(&ctx, &mut rng()).is_none());
    }

    #[test]
    fn long_inventory_lowers_both_quotes() {
        let flat = TraderContext {
            seed_probability: Some(0.5),
            ..Default::default()
        };
        let long = TraderContext {
            seed_probability: Some(0.5),
            position: 50,
            ..Default::default()
        };
        let spec = spec("fund_conservative");
        let q_flat = spec.decide(&flat, &mut rng()).unwrap();
        let q_long = spec.decide(&long, &mut rng()).unwrap();
        assert!(q_long.bid < q_flat.bid);
        assert!(q_long.ask < q_flat.ask);
    }

    #[test]
    fn noise_trader_follows_sentiment_sign() {
        let spec = spec("sent_tech");
        let up = TraderContext {
            sentiment: Some(1.0),
            ..Default::default()
        };
        let down = TraderContext {
            sentiment: Some(-1.0),
            ..Default::default()
        };
        let q_up = spec.decide(&up, &mut rng()).unwrap();
        let q_down = spec.decide(&down, &mut rng()).unwrap();
        assert!(q_up.bid > q_down.bid);
    }

    #[test]
    fn extreme_belief_clamps_to_price_grid() {
        let ctx = TraderContext {
            seed_probability: Some(0.99),
            position: -50,
            ..Default::default()
        };
        let quote = spec("fund_realtime").decide(&ctx, &mut rng()).unwrap();
        assert!((0..=100).contains(&quote.bid));
        assert!((0..=100).contains(&quote.ask));
        assert!(quote.bid <= quote.ask);
    }
}
