//! Depth parsing for a single outcome token.
//!
//! Raw depth arrives from the feed in two shapes, either an ordered pair
//! `["0.48", "120"]` or a record `{"price": 0.48, "size": 120}`, with numbers
//! encoded as JSON numbers or strings. [`parse_depth_levels`] normalizes both
//! into sorted [`DepthLevel`]s with running cumulative size and cost, and
//! [`build_side_book`] wraps a bid/ask pair into a [`SideBook`].
//!
//! Malformed entries (non-finite or negative price, non-finite or
//! non-positive size, nulls, wrong arity, missing fields) are dropped
//! silently: a single bad level must never halt quoting. Levels whose running
//! totals would overflow `Decimal` truncate the ladder at that point.

use rust_decimal::Decimal;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::debug;

/// Best bid reported for a side with no bids.
pub const EMPTY_BEST_BID: Decimal = Decimal::ZERO;

/// Best ask reported for a side with no asks ("no liquidity").
pub const EMPTY_BEST_ASK: Decimal = Decimal::ONE;

// =============================================================================
// Raw Input
// =============================================================================

/// A numeric field as delivered by the feed: JSON number or numeric string.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawNumber {
    /// JSON number (or a float produced in-process).
    Float(f64),
    /// Numeric string, the CLOB's native encoding.
    Text(String),
    /// Anything else (`null`, bool, nested value). Never converts.
    Invalid(IgnoredAny),
}

impl RawNumber {
    /// Converts to a `Decimal`, returning `None` for non-finite or unparseable input.
    #[must_use]
    pub fn to_decimal(&self) -> Option<Decimal> {
        match self {
            RawNumber::Float(v) => {
                if !v.is_finite() {
                    return None;
                }
                // f64 Display is the shortest round-trip form and never scientific
                Decimal::from_str(&v.to_string()).ok()
            }
            RawNumber::Text(s) => {
                let s = s.trim();
                Decimal::from_str(s)
                    .or_else(|_| Decimal::from_scientific(s))
                    .ok()
            }
            RawNumber::Invalid(_) => None,
        }
    }
}

impl From<f64> for RawNumber {
    fn from(v: f64) -> Self {
        RawNumber::Float(v)
    }
}

impl From<&str> for RawNumber {
    fn from(s: &str) -> Self {
        RawNumber::Text(s.to_string())
    }
}

impl From<Decimal> for RawNumber {
    fn from(d: Decimal) -> Self {
        RawNumber::Text(d.to_string())
    }
}

/// A single raw depth entry in either accepted shape.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RawLevel {
    /// `[price, size]`
    Pair(RawNumber, RawNumber),
    /// `{"price": .., "size": ..}`
    Record {
        /// Level price.
        price: RawNumber,
        /// Resting size at the level.
        size: RawNumber,
    },
    /// Wrong arity, missing fields, or not a level at all.
    Invalid(IgnoredAny),
}

impl RawLevel {
    /// Builds a pair-shaped level from anything convertible to a raw number.
    pub fn pair(price: impl Into<RawNumber>, size: impl Into<RawNumber>) -> Self {
        RawLevel::Pair(price.into(), size.into())
    }

    /// Builds a record-shaped level from anything convertible to a raw number.
    pub fn record(price: impl Into<RawNumber>, size: impl Into<RawNumber>) -> Self {
        RawLevel::Record {
            price: price.into(),
            size: size.into(),
        }
    }

    /// Returns `(price, size)` if the entry is well formed.
    #[must_use]
    pub fn validated(&self) -> Option<(Decimal, Decimal)> {
        let (price, size) = match self {
            RawLevel::Pair(p, s) => (p, s),
            RawLevel::Record { price, size } => (price, size),
            RawLevel::Invalid(_) => return None,
        };
        let price = price.to_decimal()?;
        let size = size.to_decimal()?;
        if price < Decimal::ZERO || size <= Decimal::ZERO {
            return None;
        }
        Some((price, size))
    }
}

impl From<(Decimal, Decimal)> for RawLevel {
    fn from((price, size): (Decimal, Decimal)) -> Self {
        RawLevel::pair(price, size)
    }
}

impl From<(f64, f64)> for RawLevel {
    fn from((price, size): (f64, f64)) -> Self {
        RawLevel::pair(price, size)
    }
}

// =============================================================================
// Parsed Levels
// =============================================================================

/// A parsed price level with running totals from the best price outward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DepthLevel {
    /// Level price.
    pub price: Decimal,
    /// Size resting at this level.
    pub size: Decimal,
    /// Total size from the best level through this one.
    pub cumulative_size: Decimal,
    /// Total cost (sum of price * size) from the best level through this one.
    pub cumulative_cost: Decimal,
}

/// Parses raw depth into sorted levels with cumulative size and cost.
///
/// Asks are parsed with `ascending = true` (best = lowest price), bids with
/// `ascending = false` (best = highest price). Malformed entries are dropped.
#[must_use]
pub fn parse_depth_levels(raw: &[RawLevel], ascending: bool) -> Vec<DepthLevel> {
    let mut entries: Vec<(Decimal, Decimal)> =
        raw.iter().filter_map(RawLevel::validated).collect();

    if ascending {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
    } else {
        entries.sort_by(|a, b| b.0.cmp(&a.0));
    }

    let mut levels = Vec::with_capacity(entries.len());
    let mut cumulative_size = Decimal::ZERO;
    let mut cumulative_cost = Decimal::ZERO;
    for (price, size) in entries {
        let totals = price.checked_mul(size).and_then(|cost| {
            Some((
                cumulative_size.checked_add(size)?,
                cumulative_cost.checked_add(cost)?,
            ))
        });
        let Some((next_size, next_cost)) = totals else {
            debug!(%price, %size, kept = levels.len(), "Depth totals overflow, truncating ladder");
            break;
        };
        cumulative_size = next_size;
        cumulative_cost = next_cost;
        levels.push(DepthLevel {
            price,
            size,
            cumulative_size,
            cumulative_cost,
        });
    }
    levels
}

// =============================================================================
// Side Book
// =============================================================================

/// Parsed two-sided book for one outcome token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SideBook {
    /// Bid levels, best (highest) first.
    pub bids: Vec<DepthLevel>,
    /// Ask levels, best (lowest) first.
    pub asks: Vec<DepthLevel>,
    /// Highest bid, or 0 when there are no bids.
    pub best_bid: Decimal,
    /// Lowest ask, or 1 when there are no asks.
    pub best_ask: Decimal,
    /// (best_bid + best_ask) / 2
    pub mid_price: Decimal,
    /// best_ask - best_bid
    pub spread: Decimal,
    /// Spread as a percentage of the mid price.
    pub spread_pct: Decimal,
}

impl SideBook {
    /// Wraps already-parsed levels, deriving best/mid/spread fields.
    #[must_use]
    pub fn from_levels(bids: Vec<DepthLevel>, asks: Vec<DepthLevel>) -> Self {
        let best_bid = bids.first().map_or(EMPTY_BEST_BID, |l| l.price);
        let best_ask = asks.first().map_or(EMPTY_BEST_ASK, |l| l.price);
        let mid_price = best_bid.saturating_add(best_ask) / Decimal::TWO;
        let spread = best_ask - best_bid;
        let spread_pct = if mid_price > Decimal::ZERO {
            spread / mid_price * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };

        Self {
            bids,
            asks,
            best_bid,
            best_ask,
            mid_price,
            spread,
            spread_pct,
        }
    }

    /// A book with no levels on either side.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_levels(Vec::new(), Vec::new())
    }

    /// Total resting bid size.
    #[must_use]
    pub fn total_bid_size(&self) -> Decimal {
        self.bids.last().map_or(Decimal::ZERO, |l| l.cumulative_size)
    }

    /// Total resting ask size.
    #[must_use]
    pub fn total_ask_size(&self) -> Decimal {
        self.asks.last().map_or(Decimal::ZERO, |l| l.cumulative_size)
    }

    /// Returns true if there is at least one ask.
    #[must_use]
    pub fn has_asks(&self) -> bool {
        !self.asks.is_empty()
    }
}

/// Parses raw bids and asks into a [`SideBook`].
#[must_use]
pub fn build_side_book(bids: &[RawLevel], asks: &[RawLevel]) -> SideBook {
    SideBook::from_levels(parse_depth_levels(bids, false), parse_depth_levels(asks, true))
}
