//! Engine instance that owns ledger and circuit-breaker state.
//!
//! One [`PairEngine`] per running bot. Each scan tick the owner calls
//! [`PairEngine::evaluate`] per market:
//!
//! ```text
//!  MarketDepth ──► CombinedBookBuilder ──► CombinedBook ──► generate_combined_quotes
//!                                                               │
//!  AccountingLedger ──(up, down)──► CircuitBreaker ──block flags─┤
//!                                        │                      ▼
//!                                  cancel-by-side         QuotingDecision
//!                                        ▼
//!                                  OrderGateway
//! ```
//!
//! Fills and settlements flow back through [`PairEngine::on_fill`] and
//! [`PairEngine::on_settlement`]. All state is keyed by market, so distinct
//! markets can be evaluated from concurrent tasks.

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerCheck, EmergencyCancelReport, MarketExposure};
use crate::combined_book::CombinedBook;
use crate::config::EngineConfig;
use crate::depth::RawLevel;
use crate::events::BreakerEvent;
use crate::gateway::{GatewayError, OrderGateway};
use crate::ledger::{
    AccountingLedger, FillEvent, FillOutcome, GlobalPnL, MarketPnL, PositionSnapshot, SettlementEvent,
    SettlementOutcome,
};
use crate::quoting::{generate_combined_quotes, QuotingDecision};
use crate::types::{MarketDescriptor, OutcomeSide};

/// Errors returned by [`PairEngine`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The market was never registered, or has been expired.
    #[error("unknown market: {0}")]
    UnknownMarket(String),

    /// The market's expiry has passed.
    #[error("market expired: {0}")]
    MarketExpired(String),

    /// Gateway call failed.
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Raw depth for one token.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TokenDepth {
    /// Bid levels, any order.
    #[serde(default)]
    pub bids: Vec<RawLevel>,
    /// Ask levels, any order.
    #[serde(default)]
    pub asks: Vec<RawLevel>,
}

/// Raw depth for both tokens of a market.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct MarketDepth {
    /// UP token depth.
    #[serde(default)]
    pub up: TokenDepth,
    /// DOWN token depth.
    #[serde(default)]
    pub down: TokenDepth,
}

/// Result of one evaluation tick.
#[derive(Debug, Clone, Serialize)]
pub struct TickOutcome {
    /// Combined book for this tick.
    pub book: CombinedBook,
    /// Circuit breaker verdict.
    pub safety: CircuitBreakerCheck,
    /// Quotes after block flags were applied.
    pub decision: QuotingDecision,
}

/// Paired-outcome quoting engine.
pub struct PairEngine {
    config: EngineConfig,
    ledger: RwLock<AccountingLedger>,
    breaker: CircuitBreaker,
    markets: RwLock<HashMap<String, MarketDescriptor>>,
}

impl std::fmt::Debug for PairEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairEngine")
            .field("config", &self.config)
            .field("markets", &self.markets.read().len())
            .field("breaker", &self.breaker)
            .finish()
    }
}

impl PairEngine {
    /// Creates an engine with an empty ledger.
    #[must_use]
    pub fn new(config: EngineConfig, gateway: Arc<dyn OrderGateway>) -> Self {
        let breaker = CircuitBreaker::new(config.circuit_breaker.clone(), gateway);
        Self {
            config,
            ledger: RwLock::new(AccountingLedger::new()),
            breaker,
            markets: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the circuit breaker.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Subscribes to circuit breaker events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.breaker.subscribe()
    }

    /// Registers (or replaces) a market.
    pub fn register_market(&self, market: MarketDescriptor) {
        info!(
            market_id = %market.market_id,
            asset = %market.asset,
            expires_at = ?market.expires_at,
            "Market registered"
        );
        self.markets.write().insert(market.market_id.clone(), market);
    }

    /// Returns a registered market.
    #[must_use]
    pub fn market(&self, market_id: &str) -> Option<MarketDescriptor> {
        self.markets.read().get(market_id).cloned()
    }

    /// IDs of all registered markets.
    #[must_use]
    pub fn market_ids(&self) -> Vec<String> {
        self.markets.read().keys().cloned().collect()
    }

    fn require_market(&self, market_id: &str) -> Result<MarketDescriptor, EngineError> {
        self.market(market_id)
            .ok_or_else(|| EngineError::UnknownMarket(market_id.to_string()))
    }

    /// Runs one tick for a market: builds the combined book, checks the
    /// circuit breaker against ledger inventory, and generates quotes with
    /// the blocked side removed.
    ///
    /// Cancellations are suppressed if either `dry_run` or the configured
    /// `dry_run` is set.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownMarket`] or [`EngineError::MarketExpired`].
    pub async fn evaluate(
        &self,
        market_id: &str,
        depth: &MarketDepth,
        dry_run: bool,
    ) -> Result<TickOutcome, EngineError> {
        let market = self.require_market(market_id)?;
        if market.is_expired(Utc::now()) {
            return Err(EngineError::MarketExpired(market_id.to_string()));
        }

        let book = self
            .config
            .book
            .build(&depth.up.bids, &depth.up.asks, &depth.down.bids, &depth.down.asks);

        let (up_qty, down_qty) = self.ledger.read().open_quantities(market_id);
        let safety = self
            .breaker
            .check_market(
                &MarketExposure::new(&market, up_qty, down_qty),
                dry_run || self.config.dry_run,
            )
            .await;

        let mut decision = generate_combined_quotes(&book, &self.config.quoting);
        decision.apply_side_blocks(safety.should_block_up, safety.should_block_down);

        debug!(
            market_id,
            combined_ask = %book.combined_best_ask,
            edge = %book.edge,
            safety = %safety.level,
            up_quotes = decision.up_quotes.len(),
            down_quotes = decision.down_quotes.len(),
            blocked = decision.blocked,
            "Tick evaluated"
        );

        Ok(TickOutcome {
            book,
            safety,
            decision,
        })
    }

    /// Books a fill.
    ///
    /// Fills are accepted for any market ID, registered or not, so inventory
    /// is never lost to a registration race.
    pub fn on_fill(&self, fill: &FillEvent) -> FillOutcome {
        self.ledger.write().process_fill(fill)
    }

    /// Settles a market and clears its circuit breaker block.
    ///
    /// Entries are settled under the event's asset, which is the asset the
    /// fills were booked under. A mismatch with the registered asset is logged.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownMarket`] if the market is not registered.
    pub fn on_settlement(&self, event: &SettlementEvent) -> Result<SettlementOutcome, EngineError> {
        let market = self.require_market(&event.market_id)?;
        if event.asset != market.asset {
            warn!(
                market_id = %event.market_id,
                registered = %market.asset,
                reported = %event.asset,
                "Settlement asset differs from registered market"
            );
        }
        let outcome = self
            .ledger
            .write()
            .process_settlement(&event.market_id, &event.asset, event.winning_side);
        self.breaker.clear_market_block(&event.market_id);
        Ok(outcome)
    }

    /// Records mark prices for unrealized PnL. `None` keeps the previous mark.
    pub fn update_marks(&self, market_id: &str, up: Option<Decimal>, down: Option<Decimal>) {
        self.ledger.write().update_mark_prices(market_id, up, down);
    }

    /// Open `(UP, DOWN)` shares for a market.
    #[must_use]
    pub fn open_quantities(&self, market_id: &str) -> (Decimal, Decimal) {
        self.ledger.read().open_quantities(market_id)
    }

    /// PnL read model for a registered market.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownMarket`] if the market is not registered.
    pub fn market_pnl(&self, market_id: &str) -> Result<MarketPnL, EngineError> {
        let market = self.require_market(market_id)?;
        Ok(self.ledger.read().market_pnl(market_id, &market.asset))
    }

    /// Aggregate PnL across every ledger entry.
    #[must_use]
    pub fn global_pnl(&self) -> GlobalPnL {
        self.ledger.read().global_pnl()
    }

    /// Overwrites open positions from an external source of truth.
    ///
    /// Returns the number of snapshots applied.
    pub fn reconcile(&self, snapshots: &[PositionSnapshot]) -> usize {
        let mut ledger = self.ledger.write();
        for snapshot in snapshots {
            ledger.initialize_position(snapshot);
        }
        info!(positions = snapshots.len(), "Ledger reconciled");
        snapshots.len()
    }

    /// Retires a market: returns its final PnL, clears its block, its ledger
    /// entries and its registration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownMarket`] if the market is not registered.
    pub fn expire_market(&self, market_id: &str) -> Result<MarketPnL, EngineError> {
        let market = self.require_market(market_id)?;
        let final_pnl = {
            let mut ledger = self.ledger.write();
            let pnl = ledger.market_pnl(market_id, &market.asset);
            ledger.clear_market(market_id);
            pnl
        };
        self.breaker.clear_market_block(market_id);
        self.markets.write().remove(market_id);

        info!(
            market_id,
            realized = %final_pnl.realized_pnl_usd,
            unpaired = %final_pnl.unpaired_shares,
            "Market expired"
        );
        Ok(final_pnl)
    }

    /// Cancels every resting order on a market's two tokens.
    ///
    /// Nothing is sent when `dry_run` or the configured dry run is set.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownMarket`], or [`EngineError::Gateway`] if
    /// open orders could be listed for neither token.
    pub async fn emergency_cancel(
        &self,
        market_id: &str,
        dry_run: bool,
    ) -> Result<EmergencyCancelReport, EngineError> {
        let market = self.require_market(market_id)?;
        Ok(self
            .breaker
            .emergency_cancel(&market, dry_run || self.config.dry_run)
            .await?)
    }
}
