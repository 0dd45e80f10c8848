//! Combined UP/DOWN book analysis.
//!
//! A binary market is a pair of complementary tokens whose payouts sum to
//! exactly $1.00. Buying one UP and one DOWN share for less than $1.00 locks
//! in the difference, so the interesting quantity is the *combined* ask:
//!
//! ```text
//! combined_best_ask = up.best_ask + down.best_ask
//! edge              = 1.00 - combined_best_ask
//! ```
//!
//! [`CombinedBookBuilder`] turns raw depth for both tokens into a
//! [`CombinedBook`]: best prices, depth-weighted averages at fixed sizes, and
//! the largest pair size that still carries positive edge.
//!
//! # Example
//!
//! ```
//! use pairquote_engine::combined_book::build_combined_book;
//! use pairquote_engine::depth::RawLevel;
//! use rust_decimal_macros::dec;
//!
//! let up_asks = vec![RawLevel::from((dec!(0.48), dec!(100)))];
//! let down_asks = vec![RawLevel::from((dec!(0.47), dec!(100)))];
//!
//! let book = build_combined_book(&[], &up_asks, &[], &down_asks);
//! assert_eq!(book.combined_best_ask, dec!(0.95));
//! assert_eq!(book.edge, dec!(0.05));
//! assert!(book.has_edge);
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::depth::{build_side_book, DepthLevel, RawLevel, SideBook, EMPTY_BEST_ASK};
use crate::types::OutcomeSide;

/// Lowest bid price the builder will suggest.
pub const MIN_QUOTE_PRICE: Decimal = dec!(0.01);

/// Fixed sizes at which the combined VWAP is reported.
pub const VWAP_TARGET_SIZES: [Decimal; 3] = [dec!(10), dec!(25), dec!(50)];

// =============================================================================
// Configuration
// =============================================================================

/// Strategy used to find the largest pair size with positive edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingSearch {
    /// Bisection over whole-share sizes. Assumes edge is non-increasing in size.
    #[default]
    Binary,
    /// Scan downward from the depth cap; correct for any edge curve.
    Linear,
}

/// Builds [`CombinedBook`]s from raw depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CombinedBookBuilder {
    /// Price increment used to step inside the opposing ask. Default: 0.01
    pub tick_size: Decimal,

    /// Search used for `max_pairable_shares`. Default: binary
    pub pairing_search: PairingSearch,

    /// Minimum level count on every bid and ask list for a liquid book.
    /// Default: 3
    pub min_levels_for_liquidity: usize,

    /// Maximum distance of each mid from 0.50 for a balanced book.
    /// Default: 0.15
    pub balance_tolerance: Decimal,
}

impl Default for CombinedBookBuilder {
    fn default() -> Self {
        Self {
            tick_size: dec!(0.01),
            pairing_search: PairingSearch::Binary,
            min_levels_for_liquidity: 3,
            balance_tolerance: dec!(0.15),
        }
    }
}

impl CombinedBookBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the tick size.
    #[must_use]
    pub fn with_tick_size(mut self, tick: Decimal) -> Self {
        self.tick_size = tick;
        self
    }

    /// Sets the pairing search strategy.
    #[must_use]
    pub fn with_pairing_search(mut self, search: PairingSearch) -> Self {
        self.pairing_search = search;
        self
    }

    /// Parses raw depth for both tokens and builds the combined view.
    #[must_use]
    pub fn build(
        &self,
        up_bids: &[RawLevel],
        up_asks: &[RawLevel],
        down_bids: &[RawLevel],
        down_asks: &[RawLevel],
    ) -> CombinedBook {
        self.from_side_books(
            build_side_book(up_bids, up_asks),
            build_side_book(down_bids, down_asks),
        )
    }

    /// Builds the combined view from already-parsed side books.
    #[must_use]
    pub fn from_side_books(&self, up: SideBook, down: SideBook) -> CombinedBook {
        let combined_best_ask = up.best_ask.saturating_add(down.best_ask);
        let combined_best_bid = up.best_bid.saturating_add(down.best_bid);
        let edge = Decimal::ONE - combined_best_ask;
        let edge_pct = edge
            .checked_div(combined_best_ask)
            .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
            .unwrap_or(Decimal::ZERO);

        let [at_10, at_25, at_50] = VWAP_TARGET_SIZES.map(|size| {
            vwap_for_size(&up.asks, size).saturating_add(vwap_for_size(&down.asks, size))
        });

        let max_pairable_shares = self.max_pairable_shares(&up.asks, &down.asks);

        // One tick inside the opposing ask keeps the pair under $1.00
        let optimal_up_bid = (Decimal::ONE - down.best_ask)
            .saturating_sub(self.tick_size)
            .max(MIN_QUOTE_PRICE);
        let optimal_down_bid = (Decimal::ONE - up.best_ask)
            .saturating_sub(self.tick_size)
            .max(MIN_QUOTE_PRICE);

        let min = self.min_levels_for_liquidity;
        let is_liquid = up.bids.len() >= min
            && up.asks.len() >= min
            && down.bids.len() >= min
            && down.asks.len() >= min;

        let half = dec!(0.5);
        let is_balanced = (up.mid_price - half).abs() <= self.balance_tolerance
            && (down.mid_price - half).abs() <= self.balance_tolerance;

        CombinedBook {
            up,
            down,
            combined_best_ask,
            combined_best_bid,
            edge,
            edge_pct,
            has_edge: edge > Decimal::ZERO,
            max_pairable_shares,
            avg_combined_ask_at_10: at_10,
            avg_combined_ask_at_25: at_25,
            avg_combined_ask_at_50: at_50,
            optimal_up_bid,
            optimal_down_bid,
            is_liquid,
            is_balanced,
            timestamp: Utc::now(),
        }
    }

    /// Largest whole-share pair size whose depth-weighted edge is positive.
    #[must_use]
    pub fn max_pairable_shares(&self, up_asks: &[DepthLevel], down_asks: &[DepthLevel]) -> Decimal {
        let up_depth = up_asks.last().map_or(Decimal::ZERO, |l| l.cumulative_size);
        let down_depth = down_asks.last().map_or(Decimal::ZERO, |l| l.cumulative_size);
        let cap = up_depth.min(down_depth).floor();
        if cap < Decimal::ONE {
            return Decimal::ZERO;
        }

        let has_edge = |size: Decimal| analyze_depth_for_pairing(up_asks, down_asks, size).has_edge();

        match self.pairing_search {
            PairingSearch::Binary => {
                let mut lo = Decimal::ZERO;
                let mut hi = cap;
                while lo < hi {
                    let mid = lo + ((hi - lo) / Decimal::TWO).ceil();
                    if has_edge(mid) {
                        lo = mid;
                    } else {
                        hi = mid - Decimal::ONE;
                    }
                }
                lo
            }
            PairingSearch::Linear => {
                let mut size = cap;
                while size >= Decimal::ONE {
                    if has_edge(size) {
                        return size;
                    }
                    size -= Decimal::ONE;
                }
                Decimal::ZERO
            }
        }
    }
}

/// Builds a combined book with the default builder settings.
#[must_use]
pub fn build_combined_book(
    up_bids: &[RawLevel],
    up_asks: &[RawLevel],
    down_bids: &[RawLevel],
    down_asks: &[RawLevel],
) -> CombinedBook {
    CombinedBookBuilder::default().build(up_bids, up_asks, down_bids, down_asks)
}

// =============================================================================
// Combined Book
// =============================================================================

/// Per-tick snapshot of both outcome books and the pairing edge.
///
/// Rebuilt every evaluation tick and never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct CombinedBook {
    /// UP token book.
    pub up: SideBook,
    /// DOWN token book.
    pub down: SideBook,
    /// up.best_ask + down.best_ask
    pub combined_best_ask: Decimal,
    /// up.best_bid + down.best_bid
    pub combined_best_bid: Decimal,
    /// 1.00 - combined_best_ask
    pub edge: Decimal,
    /// Edge as a percentage of the combined ask.
    pub edge_pct: Decimal,
    /// edge > 0
    pub has_edge: bool,
    /// Largest pair size with positive depth-weighted edge.
    pub max_pairable_shares: Decimal,
    /// Combined VWAP ask for 10 pairs.
    pub avg_combined_ask_at_10: Decimal,
    /// Combined VWAP ask for 25 pairs.
    pub avg_combined_ask_at_25: Decimal,
    /// Combined VWAP ask for 50 pairs.
    pub avg_combined_ask_at_50: Decimal,
    /// Suggested UP bid: one tick inside the DOWN best ask's complement.
    pub optimal_up_bid: Decimal,
    /// Suggested DOWN bid: one tick inside the UP best ask's complement.
    pub optimal_down_bid: Decimal,
    /// Enough levels on all four sides.
    pub is_liquid: bool,
    /// Both mids close to 0.50.
    pub is_balanced: bool,
    /// Build time.
    pub timestamp: DateTime<Utc>,
}

impl CombinedBook {
    /// Returns the book for the given side.
    #[must_use]
    pub fn side(&self, side: OutcomeSide) -> &SideBook {
        match side {
            OutcomeSide::Up => &self.up,
            OutcomeSide::Down => &self.down,
        }
    }
}

// =============================================================================
// Depth Walking
// =============================================================================

/// Volume-weighted average ask price to fill `target` shares.
///
/// Returns 1.00 for an empty book and the best level's price when depth is
/// insufficient to fill the whole target.
#[must_use]
pub fn vwap_for_size(levels: &[DepthLevel], target: Decimal) -> Decimal {
    let Some(best) = levels.first() else {
        return EMPTY_BEST_ASK;
    };
    match fill_cost(levels, target) {
        Some(cost) if target > Decimal::ZERO => cost / target,
        _ => best.price,
    }
}

/// Total cost of filling exactly `size` shares, or `None` if depth is insufficient.
fn fill_cost(levels: &[DepthLevel], size: Decimal) -> Option<Decimal> {
    if size <= Decimal::ZERO {
        return None;
    }
    let idx = levels.iter().position(|l| l.cumulative_size >= size)?;
    let (prev_size, prev_cost) = if idx == 0 {
        (Decimal::ZERO, Decimal::ZERO)
    } else {
        (levels[idx - 1].cumulative_size, levels[idx - 1].cumulative_cost)
    };
    (size - prev_size)
        .checked_mul(levels[idx].price)
        .and_then(|partial| prev_cost.checked_add(partial))
}

/// Depth-weighted cost of buying `size` UP and `size` DOWN shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PairingAnalysis {
    /// Evaluated pair size.
    pub size: Decimal,
    /// UP VWAP for `size`, if fillable.
    pub up_vwap: Option<Decimal>,
    /// DOWN VWAP for `size`, if fillable.
    pub down_vwap: Option<Decimal>,
    /// up_vwap + down_vwap, if both fillable.
    pub combined_cost: Option<Decimal>,
    /// 1.00 - combined_cost, if both fillable.
    pub edge: Option<Decimal>,
    /// Both ladders hold at least `size` shares.
    pub fillable: bool,
}

impl PairingAnalysis {
    /// Both sides fill and the pair costs less than $1.00.
    #[must_use]
    pub fn has_edge(&self) -> bool {
        self.edge.is_some_and(|e| e > Decimal::ZERO)
    }
}

/// Walks both ask ladders to price a pair of `size` shares.
#[must_use]
pub fn analyze_depth_for_pairing(
    up_asks: &[DepthLevel],
    down_asks: &[DepthLevel],
    size: Decimal,
) -> PairingAnalysis {
    let up_vwap = fill_cost(up_asks, size).map(|c| c / size);
    let down_vwap = fill_cost(down_asks, size).map(|c| c / size);
    let combined_cost = match (up_vwap, down_vwap) {
        (Some(u), Some(d)) => u.checked_add(d),
        _ => None,
    };

    PairingAnalysis {
        size,
        up_vwap,
        down_vwap,
        combined_cost,
        edge: combined_cost.map(|c| Decimal::ONE - c),
        fillable: combined_cost.is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depth::parse_depth_levels;
    use std::str::FromStr;

    fn levels(raw: &[(Decimal, Decimal)]) -> Vec<RawLevel> {
        raw.iter().map(|&l| RawLevel::from(l)).collect()
    }

    fn deep_book() -> CombinedBook {
        build_combined_book(
            &levels(&[(dec!(0.44), dec!(100)), (dec!(0.43), dec!(100)), (dec!(0.42), dec!(100))]),
            &levels(&[(dec!(0.45), dec!(50)), (dec!(0.50), dec!(50)), (dec!(0.61), dec!(100))]),
            &levels(&[(dec!(0.44), dec!(100)), (dec!(0.43), dec!(100)), (dec!(0.42), dec!(100))]),
            &levels(&[(dec!(0.45), dec!(100)), (dec!(0.55), dec!(100)), (dec!(0.65), dec!(10))]),
        )
    }

    #[test]
    fn test_edge_from_best_asks() {
        let book = build_combined_book(
            &[],
            &levels(&[(dec!(0.48), dec!(100))]),
            &[],
            &levels(&[(dec!(0.47), dec!(100))]),
        );

        assert_eq!(book.combined_best_ask, dec!(0.95));
        assert_eq!(book.edge, dec!(0.05));
        assert_eq!(book.edge, Decimal::ONE - book.combined_best_ask);
        assert!(book.has_edge);
    }

    #[test]
    fn test_no_edge_when_combined_ask_at_or_above_one() {
        let book = build_combined_book(
            &[],
            &levels(&[(dec!(0.52), dec!(100))]),
            &[],
            &levels(&[(dec!(0.48), dec!(100))]),
        );

        assert_eq!(book.edge, Decimal::ZERO);
        assert!(!book.has_edge);
        assert_eq!(book.max_pairable_shares, Decimal::ZERO);
    }

    #[test]
    fn test_empty_books_have_no_edge() {
        let book = build_combined_book(&[], &[], &[], &[]);

        assert_eq!(book.combined_best_ask, dec!(2));
        assert_eq!(book.edge, dec!(-1));
        assert!(!book.has_edge);
        assert!(!book.is_liquid);
        assert_eq!(book.optimal_up_bid, MIN_QUOTE_PRICE);
        assert_eq!(book.optimal_down_bid, MIN_QUOTE_PRICE);
    }

    #[test]
    fn test_max_pairable_shares_binary() {
        let book = deep_book();
        // 146 pairs cost 145.86; 147 pairs cost 147.02
        assert_eq!(book.max_pairable_shares, dec!(146));
    }

    #[test]
    fn test_huge_depth_does_not_overflow() {
        let huge = Decimal::from_str("50000000000000000000000000000").unwrap();
        let book = build_combined_book(
            &levels(&[(dec!(0.40), huge)]),
            &levels(&[(dec!(0.45), huge)]),
            &levels(&[(dec!(0.40), huge)]),
            &levels(&[(dec!(0.45), huge)]),
        );

        assert_eq!(book.combined_best_ask, dec!(0.90));
        assert_eq!(book.avg_combined_ask_at_50, dec!(0.90));
        assert_eq!(book.max_pairable_shares, huge);

        let analysis = analyze_depth_for_pairing(&book.up.asks, &book.down.asks, huge);
        assert_eq!(analysis.combined_cost, Some(dec!(0.90)));
    }

    #[test]
    fn test_max_pairable_shares_linear_matches_binary() {
        let book = deep_book();
        let linear = CombinedBookBuilder::new().with_pairing_search(PairingSearch::Linear);
        let shares = linear.max_pairable_shares(&book.up.asks, &book.down.asks);
        assert_eq!(shares, book.max_pairable_shares);
    }

    #[test]
    fn test_combined_vwap_at_fixed_sizes() {
        let book = deep_book();
        assert_eq!(book.avg_combined_ask_at_10, dec!(0.90));
        assert_eq!(book.avg_combined_ask_at_50, dec!(0.90));
    }

    #[test]
    fn test_vwap_walks_levels() {
        let asks = parse_depth_levels(
            &levels(&[(dec!(0.50), dec!(100)), (dec!(0.51), dec!(200))]),
            true,
        );
        // 100 @ 0.50 + 50 @ 0.51 = 75.5
        assert_eq!(vwap_for_size(&asks, dec!(150)), dec!(75.5) / dec!(150));
    }

    #[test]
    fn test_vwap_insufficient_depth_returns_best_price() {
        let asks = parse_depth_levels(&levels(&[(dec!(0.50), dec!(5)), (dec!(0.60), dec!(2))]), true);
        assert_eq!(vwap_for_size(&asks, dec!(10)), dec!(0.50));
        assert_eq!(vwap_for_size(&[], dec!(10)), Decimal::ONE);
    }

    #[test]
    fn test_analyze_depth_for_pairing() {
        let book = deep_book();

        let analysis = analyze_depth_for_pairing(&book.up.asks, &book.down.asks, dec!(100));
        assert_eq!(analysis.up_vwap, Some(dec!(0.475)));
        assert_eq!(analysis.down_vwap, Some(dec!(0.45)));
        assert_eq!(analysis.edge, Some(dec!(0.075)));
        assert!(analysis.has_edge());

        let too_big = analyze_depth_for_pairing(&book.up.asks, &book.down.asks, dec!(1000));
        assert!(too_big.combined_cost.is_none());
        assert!(!too_big.has_edge());
    }

    #[test]
    fn test_optimal_bids_step_inside_opposing_ask() {
        let book = deep_book();
        // 1 - 0.45 - 0.01
        assert_eq!(book.optimal_up_bid, dec!(0.54));
        assert_eq!(book.optimal_down_bid, dec!(0.54));
    }

    #[test]
    fn test_liquidity_and_balance_flags() {
        let book = deep_book();
        assert!(book.is_liquid);
        // up mid = (0.44 + 0.45) / 2 = 0.445
        assert!(book.is_balanced);

        let skewed = build_combined_book(
            &levels(&[(dec!(0.80), dec!(10))]),
            &levels(&[(dec!(0.82), dec!(10))]),
            &levels(&[(dec!(0.16), dec!(10))]),
            &levels(&[(dec!(0.18), dec!(10))]),
        );
        assert!(!skewed.is_liquid);
        assert!(!skewed.is_balanced);
    }

    #[test]
    fn test_edge_pct_relative_to_cost() {
        let book = build_combined_book(
            &[],
            &levels(&[(dec!(0.40), dec!(10))]),
            &[],
            &levels(&[(dec!(0.40), dec!(10))]),
        );
        // 0.20 / 0.80 * 100
        assert_eq!(book.edge_pct, dec!(25));
    }
}
