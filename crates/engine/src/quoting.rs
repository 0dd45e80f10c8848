//! Paired bid generation from a [`CombinedBook`].
//!
//! [`generate_combined_quotes`] turns the combined view into a ladder of
//! resting bids on both tokens, each rung priced so that filling it and
//! buying the opposing token at its current best ask still clears
//! `min_edge`. The generator never fails: an unquotable book produces a
//! blocked [`QuotingDecision`] with a [`BlockReason`] code.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::combined_book::CombinedBook;
use crate::types::OutcomeSide;

/// Lowest rung price that will be quoted.
pub const MIN_RUNG_PRICE: Decimal = dec!(0.05);

/// Highest rung price that will be quoted.
pub const MAX_RUNG_PRICE: Decimal = dec!(0.95);

// =============================================================================
// Configuration
// =============================================================================

/// Quoting policy knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuoteConfig {
    /// Minimum edge per pair required to quote.
    /// Default: 0.01
    pub min_edge: Decimal,

    /// Cap on total shares quoted per side.
    /// Default: 100
    pub max_shares_per_side: Decimal,

    /// Number of price rungs per side.
    /// Default: 3
    pub num_levels: u32,

    /// Price distance between rungs.
    /// Default: 0.01
    pub level_step: Decimal,

    /// Minimum profitable size needed before quoting at all.
    /// Default: 5
    pub min_shares_per_level: Decimal,
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            min_edge: dec!(0.01),
            max_shares_per_side: dec!(100),
            num_levels: 3,
            level_step: dec!(0.01),
            min_shares_per_level: dec!(5),
        }
    }
}

impl QuoteConfig {
    /// Builder method to set the minimum edge.
    #[must_use]
    pub fn with_min_edge(mut self, edge: Decimal) -> Self {
        self.min_edge = edge;
        self
    }

    /// Builder method to set the per-side share cap.
    #[must_use]
    pub fn with_max_shares_per_side(mut self, shares: Decimal) -> Self {
        self.max_shares_per_side = shares;
        self
    }

    /// Builder method to set the rung count.
    #[must_use]
    pub fn with_num_levels(mut self, levels: u32) -> Self {
        self.num_levels = levels;
        self
    }

    /// Builder method to set the rung spacing.
    #[must_use]
    pub fn with_level_step(mut self, step: Decimal) -> Self {
        self.level_step = step;
        self
    }

    /// Builder method to set the minimum quotable size.
    #[must_use]
    pub fn with_min_shares_per_level(mut self, shares: Decimal) -> Self {
        self.min_shares_per_level = shares;
        self
    }

    /// Checks that every knob is usable.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.num_levels == 0 {
            return Err("quoting.num_levels must be at least 1".to_string());
        }
        if self.max_shares_per_side <= Decimal::ZERO {
            return Err("quoting.max_shares_per_side must be positive".to_string());
        }
        if self.level_step < Decimal::ZERO {
            return Err("quoting.level_step must not be negative".to_string());
        }
        if self.min_edge < Decimal::ZERO {
            return Err("quoting.min_edge must not be negative".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// Decision Types
// =============================================================================

/// Why a book could not be quoted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockReason {
    /// Combined ask leaves no edge (or less than `min_edge`).
    NoEdge,
    /// Fewer than the required levels on some side.
    LowLiquidity,
    /// Profitable depth smaller than `min_shares_per_level`.
    LowDepth,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::NoEdge => write!(f, "NO_EDGE"),
            BlockReason::LowLiquidity => write!(f, "LOW_LIQUIDITY"),
            BlockReason::LowDepth => write!(f, "LOW_DEPTH"),
        }
    }
}

/// A candidate resting bid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quote {
    /// Token side to bid on.
    pub side: OutcomeSide,
    /// Limit price.
    pub price: Decimal,
    /// Shares.
    pub size: Decimal,
    /// 1.00 - (price + opposing best ask)
    pub expected_edge: Decimal,
    /// expected_edge * 100; higher is better.
    pub priority: Decimal,
}

/// Output of one quoting pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotingDecision {
    /// Bids on the UP token, best price first.
    pub up_quotes: Vec<Quote>,
    /// Bids on the DOWN token, best price first.
    pub down_quotes: Vec<Quote>,
    /// Sum of UP quote sizes.
    pub total_up_shares: Decimal,
    /// Sum of DOWN quote sizes.
    pub total_down_shares: Decimal,
    /// True if the whole book was refused.
    pub blocked: bool,
    /// Refusal code when `blocked`.
    pub reason: Option<BlockReason>,
    /// Side whose quotes were removed by the circuit breaker, if any.
    pub blocked_side: Option<OutcomeSide>,
    /// Human-readable explanation.
    pub reasoning: String,
}

impl QuotingDecision {
    fn refused(reason: BlockReason, reasoning: String) -> Self {
        Self {
            up_quotes: Vec::new(),
            down_quotes: Vec::new(),
            total_up_shares: Decimal::ZERO,
            total_down_shares: Decimal::ZERO,
            blocked: true,
            reason: Some(reason),
            blocked_side: None,
            reasoning,
        }
    }

    /// Drops the quotes of a side the circuit breaker has blocked.
    ///
    /// At most one side is ever blocked; if both flags are set the UP flag wins.
    pub fn apply_side_blocks(&mut self, block_up: bool, block_down: bool) {
        let side = if block_up {
            OutcomeSide::Up
        } else if block_down {
            OutcomeSide::Down
        } else {
            return;
        };

        let dropped = match side {
            OutcomeSide::Up => {
                self.total_up_shares = Decimal::ZERO;
                std::mem::take(&mut self.up_quotes).len()
            }
            OutcomeSide::Down => {
                self.total_down_shares = Decimal::ZERO;
                std::mem::take(&mut self.down_quotes).len()
            }
        };
        self.blocked_side = Some(side);
        self.reasoning
            .push_str(&format!("; {side} blocked by circuit breaker ({dropped} quotes dropped)"));
    }

    /// Quotes for a side.
    #[must_use]
    pub fn quotes(&self, side: OutcomeSide) -> &[Quote] {
        match side {
            OutcomeSide::Up => &self.up_quotes,
            OutcomeSide::Down => &self.down_quotes,
        }
    }

    /// Total number of quotes across both sides.
    #[must_use]
    pub fn quote_count(&self) -> usize {
        self.up_quotes.len() + self.down_quotes.len()
    }
}

// =============================================================================
// Generator
// =============================================================================

/// Generates a paired bid ladder for both tokens.
///
/// Refusals, in order:
/// 1. `NO_EDGE` if the book has no edge or less than `min_edge`
/// 2. `LOW_LIQUIDITY` if the book is not liquid
/// 3. `LOW_DEPTH` if the profitable size is below `min_shares_per_level`
#[must_use]
pub fn generate_combined_quotes(book: &CombinedBook, config: &QuoteConfig) -> QuotingDecision {
    if !book.has_edge || book.edge < config.min_edge {
        return QuotingDecision::refused(
            BlockReason::NoEdge,
            format!(
                "combined ask {} leaves edge {} below min {}",
                book.combined_best_ask, book.edge, config.min_edge
            ),
        );
    }

    if !book.is_liquid {
        return QuotingDecision::refused(
            BlockReason::LowLiquidity,
            format!(
                "thin book: up {}/{} levels, down {}/{} levels",
                book.up.bids.len(),
                book.up.asks.len(),
                book.down.bids.len(),
                book.down.asks.len()
            ),
        );
    }

    let profitable_shares = book.max_pairable_shares.min(config.max_shares_per_side);
    if profitable_shares < config.min_shares_per_level {
        return QuotingDecision::refused(
            BlockReason::LowDepth,
            format!(
                "only {profitable_shares} profitable shares, need {}",
                config.min_shares_per_level
            ),
        );
    }

    let levels = config.num_levels.max(1);
    let size_per_level = (profitable_shares / Decimal::from(levels))
        .round_dp_with_strategy(2, RoundingStrategy::ToZero);

    let up_quotes = build_ladder(
        OutcomeSide::Up,
        book.optimal_up_bid,
        book.down.best_ask,
        size_per_level,
        levels,
        config,
    );
    let down_quotes = build_ladder(
        OutcomeSide::Down,
        book.optimal_down_bid,
        book.up.best_ask,
        size_per_level,
        levels,
        config,
    );

    let total_up_shares: Decimal = up_quotes.iter().map(|q| q.size).sum();
    let total_down_shares: Decimal = down_quotes.iter().map(|q| q.size).sum();

    let reasoning = format!(
        "edge {} ({}%), {} pairable, {} UP rungs from {} and {} DOWN rungs from {} at {} shares each",
        book.edge,
        book.edge_pct.round_dp(2),
        book.max_pairable_shares,
        up_quotes.len(),
        book.optimal_up_bid,
        down_quotes.len(),
        book.optimal_down_bid,
        size_per_level
    );

    QuotingDecision {
        up_quotes,
        down_quotes,
        total_up_shares,
        total_down_shares,
        blocked: false,
        reason: None,
        blocked_side: None,
        reasoning,
    }
}

fn build_ladder(
    side: OutcomeSide,
    start_price: Decimal,
    opposing_ask: Decimal,
    size: Decimal,
    levels: u32,
    config: &QuoteConfig,
) -> Vec<Quote> {
    (0..levels)
        .filter_map(|i| {
            let price = start_price - config.level_step * Decimal::from(i);
            if !(MIN_RUNG_PRICE..=MAX_RUNG_PRICE).contains(&price) {
                return None;
            }
            let expected_edge = Decimal::ONE - (price + opposing_ask);
            if expected_edge < config.min_edge {
                return None;
            }
            Some(Quote {
                side,
                price,
                size,
                expected_edge,
                priority: expected_edge * Decimal::ONE_HUNDRED,
            })
        })
        .collect()
}
