//! Average-cost accounting ledger for paired UP/DOWN inventory.
//!
//! Positions are keyed by `(market_id, asset, side)` and tracked with
//! average-cost accounting:
//!
//! - **BUY** capitalizes price and fee into the open cost basis
//! - **SELL** realizes `qty * (price - avg_cost)` and releases `qty * avg_cost`
//!   of basis; sells larger than the open position are clamped
//! - **Settlement** redeems the winning side at $1.00 and writes off the loser
//!
//! # Invariants
//!
//! - `open_shares >= 0` and `open_cost_usd >= 0`
//! - `open_shares == 0` implies `open_cost_usd == 0`
//!
//! # Fees
//!
//! `fee_usd` is a non-negative cost in USD. Negative values (maker rebates)
//! are ignored and logged; rebates are not booked here.
//!
//! # Ordering
//!
//! The running average is order-dependent, so fills must be delivered in
//! arrival order per key. The ledger does not reorder.
//!
//! # Example
//!
//! ```
//! use pairquote_engine::ledger::{AccountingLedger, FillEvent};
//! use pairquote_engine::types::{FillAction, OutcomeSide};
//! use rust_decimal_macros::dec;
//!
//! let mut ledger = AccountingLedger::new();
//! ledger.process_fill(&FillEvent::new("m1", "BTC", OutcomeSide::Up, FillAction::Buy, dec!(10), dec!(0.40)));
//! ledger.process_fill(&FillEvent::new("m1", "BTC", OutcomeSide::Up, FillAction::Buy, dec!(10), dec!(0.60)));
//!
//! let entry = ledger.entry("m1", "BTC", OutcomeSide::Up).unwrap();
//! assert_eq!(entry.open_shares, dec!(20));
//! assert_eq!(entry.avg_cost(), dec!(0.50));
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::types::{FillAction, OutcomeSide};

// =============================================================================
// Events
// =============================================================================

/// An executed fill reported by the fill tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    /// Market condition ID.
    pub market_id: String,
    /// Underlying asset symbol.
    pub asset: String,
    /// Token side filled.
    pub side: OutcomeSide,
    /// Buy or sell.
    pub action: FillAction,
    /// Shares filled.
    pub qty: Decimal,
    /// Fill price per share.
    pub price: Decimal,
    /// Fee paid in USD, if any.
    #[serde(default)]
    pub fee_usd: Option<Decimal>,
    /// Exchange order ID, if known.
    #[serde(default)]
    pub order_id: Option<String>,
}

impl FillEvent {
    /// Creates a fill without fee or order ID.
    #[must_use]
    pub fn new(
        market_id: impl Into<String>,
        asset: impl Into<String>,
        side: OutcomeSide,
        action: FillAction,
        qty: Decimal,
        price: Decimal,
    ) -> Self {
        Self {
            market_id: market_id.into(),
            asset: asset.into(),
            side,
            action,
            qty,
            price,
            fee_usd: None,
            order_id: None,
        }
    }

    /// Sets the fee.
    #[must_use]
    pub fn with_fee(mut self, fee_usd: Decimal) -> Self {
        self.fee_usd = Some(fee_usd);
        self
    }

    /// Sets the order ID.
    #[must_use]
    pub fn with_order_id(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }
}

/// Market resolution reported by the settlement collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementEvent {
    /// Market condition ID.
    pub market_id: String,
    /// Underlying asset symbol.
    pub asset: String,
    /// Side that redeems at $1.00.
    pub winning_side: OutcomeSide,
}

impl SettlementEvent {
    /// Creates a settlement event.
    #[must_use]
    pub fn new(market_id: impl Into<String>, asset: impl Into<String>, winning_side: OutcomeSide) -> Self {
        Self {
            market_id: market_id.into(),
            asset: asset.into(),
            winning_side,
        }
    }
}

/// Externally sourced position used for startup reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// Market condition ID.
    pub market_id: String,
    /// Underlying asset symbol.
    pub asset: String,
    /// Token side.
    pub side: OutcomeSide,
    /// Shares held.
    pub shares: Decimal,
    /// Cost basis in USD.
    pub cost_usd: Decimal,
}

// =============================================================================
// Entries
// =============================================================================

/// Ledger key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PositionKey {
    /// Market condition ID.
    pub market_id: String,
    /// Underlying asset symbol.
    pub asset: String,
    /// Token side.
    pub side: OutcomeSide,
}

impl PositionKey {
    fn new(market_id: &str, asset: &str, side: OutcomeSide) -> Self {
        Self {
            market_id: market_id.to_string(),
            asset: asset.to_string(),
            side,
        }
    }
}

/// Accounting state for one `(market, asset, side)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountingEntry {
    /// Shares currently held.
    pub open_shares: Decimal,
    /// Average-cost basis of the held shares, fees included.
    pub open_cost_usd: Decimal,
    /// Realized PnL from sells and settlement.
    pub realized_pnl_usd: Decimal,
    /// Total USD spent on buys (excluding fees).
    pub buy_notional_usd: Decimal,
    /// Total USD received from sells.
    pub sell_notional_usd: Decimal,
    /// Total shares bought.
    pub buy_shares: Decimal,
    /// Total shares sold (after clamping).
    pub sell_shares: Decimal,
    /// Total fees paid.
    pub total_fees_usd: Decimal,
    /// Time of the last mutation.
    pub last_update_ts: DateTime<Utc>,
}

impl AccountingEntry {
    fn new() -> Self {
        Self {
            open_shares: Decimal::ZERO,
            open_cost_usd: Decimal::ZERO,
            realized_pnl_usd: Decimal::ZERO,
            buy_notional_usd: Decimal::ZERO,
            sell_notional_usd: Decimal::ZERO,
            buy_shares: Decimal::ZERO,
            sell_shares: Decimal::ZERO,
            total_fees_usd: Decimal::ZERO,
            last_update_ts: Utc::now(),
        }
    }

    /// Average cost per open share, or 0 when flat.
    #[must_use]
    pub fn avg_cost(&self) -> Decimal {
        if self.open_shares > Decimal::ZERO {
            self.open_cost_usd.checked_div(self.open_shares).unwrap_or(Decimal::ZERO)
        } else {
            Decimal::ZERO
        }
    }

    fn flatten(&mut self) {
        self.open_shares = Decimal::ZERO;
        self.open_cost_usd = Decimal::ZERO;
    }
}

// =============================================================================
// Results
// =============================================================================

/// Effect of one fill on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FillOutcome {
    /// False if the fill was rejected as malformed.
    pub applied: bool,
    /// Shares actually booked (sells may be clamped).
    pub executed_qty: Decimal,
    /// Realized PnL booked by this fill.
    pub realized_delta: Decimal,
    /// True if a sell exceeded the open position.
    pub clamped: bool,
    /// Open shares after the fill.
    pub open_shares: Decimal,
    /// Open cost basis after the fill.
    pub open_cost_usd: Decimal,
}

impl FillOutcome {
    fn rejected() -> Self {
        Self {
            applied: false,
            executed_qty: Decimal::ZERO,
            realized_delta: Decimal::ZERO,
            clamped: false,
            open_shares: Decimal::ZERO,
            open_cost_usd: Decimal::ZERO,
        }
    }
}

/// Effect of a settlement on one market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettlementOutcome {
    /// Market condition ID.
    pub market_id: String,
    /// Underlying asset symbol.
    pub asset: String,
    /// Side that redeemed at $1.00.
    pub winning_side: OutcomeSide,
    /// Realized PnL booked on the UP entry.
    pub up_realized: Decimal,
    /// Realized PnL booked on the DOWN entry.
    pub down_realized: Decimal,
    /// up_realized + down_realized
    pub total_realized: Decimal,
}

/// Last known mark prices for a market.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPrices {
    /// UP mark, if known.
    pub up: Option<Decimal>,
    /// DOWN mark, if known.
    pub down: Option<Decimal>,
}

impl MarkPrices {
    fn get(&self, side: OutcomeSide) -> Option<Decimal> {
        match side {
            OutcomeSide::Up => self.up,
            OutcomeSide::Down => self.down,
        }
    }
}

/// PnL read model for one market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarketPnL {
    /// Market condition ID.
    pub market_id: String,
    /// Underlying asset symbol.
    pub asset: String,
    /// UP shares held.
    pub up_shares: Decimal,
    /// DOWN shares held.
    pub down_shares: Decimal,
    /// UP cost basis.
    pub up_cost_usd: Decimal,
    /// DOWN cost basis.
    pub down_cost_usd: Decimal,
    /// UP average cost.
    pub up_avg_cost: Decimal,
    /// DOWN average cost.
    pub down_avg_cost: Decimal,
    /// min(UP, DOWN) shares, worth $1.00 each at settlement.
    pub paired_shares: Decimal,
    /// |UP - DOWN| shares of directional exposure.
    pub unpaired_shares: Decimal,
    /// UP mark used for unrealized PnL.
    pub up_mark: Option<Decimal>,
    /// DOWN mark used for unrealized PnL.
    pub down_mark: Option<Decimal>,
    /// Realized PnL across both sides.
    pub realized_pnl_usd: Decimal,
    /// Unrealized PnL; a side without a mark contributes 0.
    pub unrealized_pnl_usd: Decimal,
    /// realized + unrealized
    pub total_pnl_usd: Decimal,
    /// Fees paid across both sides.
    pub total_fees_usd: Decimal,
}

/// PnL read model across all markets.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct GlobalPnL {
    /// Number of `(market, asset)` pairs with entries.
    pub market_count: usize,
    /// Realized PnL.
    pub realized_pnl_usd: Decimal,
    /// Unrealized PnL.
    pub unrealized_pnl_usd: Decimal,
    /// realized + unrealized
    pub total_pnl_usd: Decimal,
    /// Fees paid.
    pub total_fees_usd: Decimal,
    /// Sum of open cost basis.
    pub open_cost_usd: Decimal,
}

// =============================================================================
// Ledger
// =============================================================================

/// Average-cost ledger owned by a single engine instance.
#[derive(Debug, Default)]
pub struct AccountingLedger {
    entries: HashMap<PositionKey, AccountingEntry>,
    marks: HashMap<String, MarkPrices>,
}

impl AccountingLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a fill.
    ///
    /// Rejected (no-op, zeroed outcome) if `qty <= 0`, `price < 0`, or any
    /// running total would overflow.
    pub fn process_fill(&mut self, fill: &FillEvent) -> FillOutcome {
        if fill.qty <= Decimal::ZERO || fill.price < Decimal::ZERO {
            warn!(
                market_id = %fill.market_id,
                side = %fill.side,
                qty = %fill.qty,
                price = %fill.price,
                "Rejected malformed fill"
            );
            return FillOutcome::rejected();
        }

        let fee = match fill.fee_usd {
            Some(f) if f < Decimal::ZERO => {
                debug!(market_id = %fill.market_id, fee = %f, "Ignoring negative fee (rebate)");
                Decimal::ZERO
            }
            Some(f) => f,
            None => Decimal::ZERO,
        };

        let key = PositionKey::new(&fill.market_id, &fill.asset, fill.side);
        let current = self.entries.get(&key).cloned().unwrap_or_else(AccountingEntry::new);

        let Some((entry, outcome)) = apply_fill(current, fill, fee) else {
            warn!(
                market_id = %fill.market_id,
                side = %fill.side,
                qty = %fill.qty,
                price = %fill.price,
                "Rejected malformed fill: totals overflow"
            );
            return FillOutcome::rejected();
        };

        self.entries.insert(key, entry);
        outcome
    }

    /// Settles a market: the winning side redeems open shares at $1.00, the
    /// losing side is written off. Both sides end flat.
    pub fn process_settlement(
        &mut self,
        market_id: &str,
        asset: &str,
        winning_side: OutcomeSide,
    ) -> SettlementOutcome {
        let mut settle = |side: OutcomeSide| -> Decimal {
            let Some(entry) = self.entries.get_mut(&PositionKey::new(market_id, asset, side)) else {
                return Decimal::ZERO;
            };
            let realized = if side == winning_side {
                entry.open_shares - entry.open_cost_usd
            } else {
                -entry.open_cost_usd
            };
            entry.realized_pnl_usd = entry.realized_pnl_usd.saturating_add(realized);
            entry.flatten();
            entry.last_update_ts = Utc::now();
            realized
        };

        let up_realized = settle(OutcomeSide::Up);
        let down_realized = settle(OutcomeSide::Down);
        let total_realized = up_realized.saturating_add(down_realized);

        info!(
            market_id,
            asset,
            winner = %winning_side,
            realized = %total_realized,
            "Market settled"
        );

        SettlementOutcome {
            market_id: market_id.to_string(),
            asset: asset.to_string(),
            winning_side,
            up_realized,
            down_realized,
            total_realized,
        }
    }

    /// Records mark prices for a market. `None` leaves the previous mark unchanged.
    pub fn update_mark_prices(&mut self, market_id: &str, up: Option<Decimal>, down: Option<Decimal>) {
        let marks = self.marks.entry(market_id.to_string()).or_default();
        if up.is_some() {
            marks.up = up;
        }
        if down.is_some() {
            marks.down = down;
        }
    }

    /// Current marks for a market.
    #[must_use]
    pub fn mark_prices(&self, market_id: &str) -> MarkPrices {
        self.marks.get(market_id).copied().unwrap_or_default()
    }

    /// Overwrites open shares and cost from an external source of truth.
    ///
    /// Realized PnL is left untouched. Negative inputs are clamped to zero.
    pub fn initialize_position(&mut self, snapshot: &PositionSnapshot) {
        let entry = self
            .entries
            .entry(PositionKey::new(&snapshot.market_id, &snapshot.asset, snapshot.side))
            .or_insert_with(AccountingEntry::new);

        entry.open_shares = snapshot.shares.max(Decimal::ZERO);
        entry.open_cost_usd = snapshot.cost_usd.max(Decimal::ZERO);
        if entry.open_shares == Decimal::ZERO {
            entry.open_cost_usd = Decimal::ZERO;
        }
        entry.last_update_ts = Utc::now();

        info!(
            market_id = %snapshot.market_id,
            side = %snapshot.side,
            shares = %entry.open_shares,
            cost = %entry.open_cost_usd,
            "Position initialized from reconciliation"
        );
    }

    /// Returns the entry for a key, if one exists.
    #[must_use]
    pub fn entry(&self, market_id: &str, asset: &str, side: OutcomeSide) -> Option<&AccountingEntry> {
        self.entries.get(&PositionKey::new(market_id, asset, side))
    }

    /// Iterates all entries.
    pub fn entries(&self) -> impl Iterator<Item = (&PositionKey, &AccountingEntry)> {
        self.entries.iter()
    }

    /// Open `(UP, DOWN)` shares for a market, summed across assets.
    #[must_use]
    pub fn open_quantities(&self, market_id: &str) -> (Decimal, Decimal) {
        self.entries
            .iter()
            .filter(|(k, _)| k.market_id == market_id)
            .fold((Decimal::ZERO, Decimal::ZERO), |(up, down), (k, e)| match k.side {
                OutcomeSide::Up => (up.saturating_add(e.open_shares), down),
                OutcomeSide::Down => (up, down.saturating_add(e.open_shares)),
            })
    }

    /// PnL for one market.
    #[must_use]
    pub fn market_pnl(&self, market_id: &str, asset: &str) -> MarketPnL {
        let empty = AccountingEntry::new();
        let up = self.entry(market_id, asset, OutcomeSide::Up).unwrap_or(&empty);
        let down = self.entry(market_id, asset, OutcomeSide::Down).unwrap_or(&empty);
        let marks = self.mark_prices(market_id);

        let side_unrealized = |side: OutcomeSide, e: &AccountingEntry| -> Decimal {
            match marks.get(side) {
                Some(mark) if e.open_shares > Decimal::ZERO => {
                    e.open_shares.saturating_mul(mark).saturating_sub(e.open_cost_usd)
                }
                _ => Decimal::ZERO,
            }
        };

        let realized = up.realized_pnl_usd.saturating_add(down.realized_pnl_usd);
        let unrealized =
            side_unrealized(OutcomeSide::Up, up).saturating_add(side_unrealized(OutcomeSide::Down, down));

        MarketPnL {
            market_id: market_id.to_string(),
            asset: asset.to_string(),
            up_shares: up.open_shares,
            down_shares: down.open_shares,
            up_cost_usd: up.open_cost_usd,
            down_cost_usd: down.open_cost_usd,
            up_avg_cost: up.avg_cost(),
            down_avg_cost: down.avg_cost(),
            paired_shares: up.open_shares.min(down.open_shares),
            unpaired_shares: (up.open_shares - down.open_shares).abs(),
            up_mark: marks.up,
            down_mark: marks.down,
            realized_pnl_usd: realized,
            unrealized_pnl_usd: unrealized,
            total_pnl_usd: realized.saturating_add(unrealized),
            total_fees_usd: up.total_fees_usd.saturating_add(down.total_fees_usd),
        }
    }

    /// PnL across every market with entries.
    #[must_use]
    pub fn global_pnl(&self) -> GlobalPnL {
        let mut markets: Vec<(&str, &str)> = self
            .entries
            .keys()
            .map(|k| (k.market_id.as_str(), k.asset.as_str()))
            .collect();
        markets.sort_unstable();
        markets.dedup();

        let mut global = GlobalPnL {
            market_count: markets.len(),
            ..GlobalPnL::default()
        };
        for (market_id, asset) in markets {
            let pnl = self.market_pnl(market_id, asset);
            global.realized_pnl_usd = global.realized_pnl_usd.saturating_add(pnl.realized_pnl_usd);
            global.unrealized_pnl_usd = global.unrealized_pnl_usd.saturating_add(pnl.unrealized_pnl_usd);
            global.total_fees_usd = global.total_fees_usd.saturating_add(pnl.total_fees_usd);
            global.open_cost_usd = global
                .open_cost_usd
                .saturating_add(pnl.up_cost_usd.saturating_add(pnl.down_cost_usd));
        }
        global.total_pnl_usd = global.realized_pnl_usd.saturating_add(global.unrealized_pnl_usd);
        global
    }

    /// Removes all entries and marks for a market.
    pub fn clear_market(&mut self, market_id: &str) {
        self.entries.retain(|k, _| k.market_id != market_id);
        self.marks.remove(market_id);
        debug!(market_id, "Ledger cleared for market");
    }

    /// Removes everything.
    pub fn clear_all(&mut self) {
        self.entries.clear();
        self.marks.clear();
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the ledger has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Books a fill against a copy of the entry. `None` if any total overflows.
fn apply_fill(
    mut entry: AccountingEntry,
    fill: &FillEvent,
    fee: Decimal,
) -> Option<(AccountingEntry, FillOutcome)> {
    entry.total_fees_usd = entry.total_fees_usd.checked_add(fee)?;
    entry.last_update_ts = Utc::now();

    let (executed_qty, realized_delta, clamped) = match fill.action {
        FillAction::Buy => {
            let notional = fill.qty.checked_mul(fill.price)?;
            entry.open_cost_usd = entry.open_cost_usd.checked_add(notional)?.checked_add(fee)?;
            entry.open_shares = entry.open_shares.checked_add(fill.qty)?;
            entry.buy_notional_usd = entry.buy_notional_usd.checked_add(notional)?;
            entry.buy_shares = entry.buy_shares.checked_add(fill.qty)?;
            (fill.qty, Decimal::ZERO, false)
        }
        FillAction::Sell => {
            let avg_cost = entry.avg_cost();
            let clamped = fill.qty > entry.open_shares;
            let qty = if clamped {
                warn!(
                    market_id = %fill.market_id,
                    asset = %fill.asset,
                    side = %fill.side,
                    requested = %fill.qty,
                    open_shares = %entry.open_shares,
                    order_id = ?fill.order_id,
                    "Accounting anomaly: sell exceeds open shares, clamping"
                );
                entry.open_shares
            } else {
                fill.qty
            };

            let realized_delta = qty.checked_mul(fill.price - avg_cost)?;
            entry.realized_pnl_usd = entry.realized_pnl_usd.checked_add(realized_delta)?;
            entry.open_cost_usd -= qty.checked_mul(avg_cost)?;
            entry.open_shares -= qty;
            let proceeds = qty.checked_mul(fill.price)?;
            entry.sell_notional_usd = entry.sell_notional_usd.checked_add(proceeds)?;
            entry.sell_shares = entry.sell_shares.checked_add(qty)?;

            // Drift guard
            if entry.open_shares <= Decimal::ZERO {
                entry.flatten();
            }
            (qty, realized_delta, clamped)
        }
    };

    let outcome = FillOutcome {
        applied: true,
        executed_qty,
        realized_delta,
        clamped,
        open_shares: entry.open_shares,
        open_cost_usd: entry.open_cost_usd,
    };
    Some((entry, outcome))
}
