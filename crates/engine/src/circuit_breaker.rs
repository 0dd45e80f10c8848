//! Imbalance circuit breaker for paired quoting.
//!
//! Paired market making is only risk-free while UP and DOWN inventory stay
//! matched. This breaker watches `imbalance = |up_qty - down_qty|` per market
//! and throttles the *leading* side (the one holding more shares):
//!
//! | Level      | Condition                          | Action                                  |
//! |------------|------------------------------------|-----------------------------------------|
//! | `Ok`       | imbalance < warning                | clear any block                         |
//! | `Warning`  | imbalance >= warning               | block new quotes on the leading side    |
//! | `Critical` | imbalance >= critical              | also cancel leading side's resting bids |
//! | `Extreme`  | imbalance >= absolute max unpaired | block until rebalanced, cancel          |
//!
//! The lagging side always keeps trading so the rebalancer can close the gap,
//! and `should_stop` is always false: the breaker never halts the engine and
//! never bans a market. The only way out of a block is rebalancing below the
//! warning threshold, or a manual [`CircuitBreaker::reset`] /
//! [`CircuitBreaker::clear_market_block`].
//!
//! # Example
//!
//! ```
//! use pairquote_engine::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, MarketExposure};
//! use pairquote_engine::gateway::{GatewayError, OpenOrder, OrderGateway};
//! use pairquote_engine::types::MarketDescriptor;
//! use rust_decimal_macros::dec;
//! use std::sync::Arc;
//!
//! struct NoopGateway;
//!
//! #[async_trait::async_trait]
//! impl OrderGateway for NoopGateway {
//!     async fn cancel_side(&self, _: &str, _: &str) -> Result<usize, GatewayError> { Ok(0) }
//!     async fn open_orders(&self, _: &str) -> Result<Vec<OpenOrder>, GatewayError> { Ok(vec![]) }
//!     async fn cancel_order(&self, _: &str) -> Result<(), GatewayError> { Ok(()) }
//! }
//!
//! # tokio_test_block_on(async {
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::default(), Arc::new(NoopGateway));
//! let market = MarketDescriptor::new("m1", "BTC", "up-token", "down-token");
//!
//! let check = breaker
//!     .check_market(&MarketExposure::new(&market, dec!(25), dec!(0)), true)
//!     .await;
//! assert!(check.should_block_up);
//! assert!(!check.should_block_down);
//! assert!(!check.should_stop);
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::events::{BreakerEvent, EVENT_CHANNEL_CAPACITY};
use crate::gateway::{GatewayError, OrderGateway};
use crate::types::{MarketDescriptor, OutcomeSide};

// =============================================================================
// Configuration
// =============================================================================

/// Imbalance thresholds, in shares.
///
/// Must satisfy `warning_threshold < critical_threshold < absolute_max_unpaired`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Imbalance at which the leading side stops quoting.
    /// Default: 10
    pub warning_threshold: Decimal,

    /// Imbalance at which the leading side's resting orders are cancelled.
    /// Default: 15
    pub critical_threshold: Decimal,

    /// Imbalance at which the leading side is held blocked until rebalanced.
    /// Default: 20
    pub absolute_max_unpaired: Decimal,

    /// Delay between sequential cancels during an emergency cancel.
    /// Default: 100ms
    #[serde(with = "duration_ms")]
    pub cancel_delay: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            warning_threshold: dec!(10),
            critical_threshold: dec!(15),
            absolute_max_unpaired: dec!(20),
            cancel_delay: Duration::from_millis(100),
        }
    }
}

impl CircuitBreakerConfig {
    /// Builder method to set all three thresholds.
    #[must_use]
    pub fn with_thresholds(mut self, warning: Decimal, critical: Decimal, absolute_max: Decimal) -> Self {
        self.warning_threshold = warning;
        self.critical_threshold = critical;
        self.absolute_max_unpaired = absolute_max;
        self
    }

    /// Builder method to set the emergency cancel delay.
    #[must_use]
    pub fn with_cancel_delay(mut self, delay: Duration) -> Self {
        self.cancel_delay = delay;
        self
    }

    /// Checks threshold ordering.
    ///
    /// # Errors
    ///
    /// Returns a description of the violated constraint.
    pub fn validate(&self) -> Result<(), String> {
        if self.warning_threshold <= Decimal::ZERO {
            return Err("circuit_breaker.warning_threshold must be positive".to_string());
        }
        if self.warning_threshold >= self.critical_threshold {
            return Err(format!(
                "circuit_breaker.warning_threshold ({}) must be below critical_threshold ({})",
                self.warning_threshold, self.critical_threshold
            ));
        }
        if self.critical_threshold >= self.absolute_max_unpaired {
            return Err(format!(
                "circuit_breaker.critical_threshold ({}) must be below absolute_max_unpaired ({})",
                self.critical_threshold, self.absolute_max_unpaired
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Levels and Inputs
// =============================================================================

/// Severity of a market's imbalance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyLevel {
    /// Below the warning threshold.
    Ok,
    /// Leading side's new quotes blocked.
    Warning,
    /// Leading side's resting orders cancelled.
    Critical,
    /// At or beyond the absolute unpaired limit.
    Extreme,
}

impl SafetyLevel {
    /// Classifies an imbalance against the configured thresholds.
    #[must_use]
    pub fn classify(imbalance: Decimal, config: &CircuitBreakerConfig) -> Self {
        if imbalance >= config.absolute_max_unpaired {
            SafetyLevel::Extreme
        } else if imbalance >= config.critical_threshold {
            SafetyLevel::Critical
        } else if imbalance >= config.warning_threshold {
            SafetyLevel::Warning
        } else {
            SafetyLevel::Ok
        }
    }

    /// Returns true if this level cancels resting orders.
    #[must_use]
    pub fn cancels_orders(self) -> bool {
        self >= SafetyLevel::Critical
    }
}

impl std::fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SafetyLevel::Ok => write!(f, "OK"),
            SafetyLevel::Warning => write!(f, "WARNING"),
            SafetyLevel::Critical => write!(f, "CRITICAL"),
            SafetyLevel::Extreme => write!(f, "EXTREME"),
        }
    }
}

/// Open inventory for one market, as derived from the ledger.
#[derive(Debug, Clone, Copy)]
pub struct MarketExposure<'a> {
    /// Market being checked.
    pub market: &'a MarketDescriptor,
    /// Open UP shares.
    pub up_qty: Decimal,
    /// Open DOWN shares.
    pub down_qty: Decimal,
}

impl<'a> MarketExposure<'a> {
    /// Creates an exposure snapshot.
    #[must_use]
    pub fn new(market: &'a MarketDescriptor, up_qty: Decimal, down_qty: Decimal) -> Self {
        Self {
            market,
            up_qty,
            down_qty,
        }
    }

    /// |up_qty - down_qty|
    #[must_use]
    pub fn imbalance(&self) -> Decimal {
        (self.up_qty - self.down_qty).abs()
    }

    /// Side holding more shares, or `None` when equal.
    #[must_use]
    pub fn leading_side(&self) -> Option<OutcomeSide> {
        match self.up_qty.cmp(&self.down_qty) {
            std::cmp::Ordering::Greater => Some(OutcomeSide::Up),
            std::cmp::Ordering::Less => Some(OutcomeSide::Down),
            std::cmp::Ordering::Equal => None,
        }
    }
}

// =============================================================================
// Results
// =============================================================================

/// Result of one [`CircuitBreaker::check_market`] evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerCheck {
    /// Always false: the breaker never halts the engine.
    pub should_stop: bool,
    /// Block new UP quotes.
    pub should_block_up: bool,
    /// Block new DOWN quotes.
    pub should_block_down: bool,
    /// Severity.
    pub level: SafetyLevel,
    /// |UP - DOWN| shares.
    pub imbalance: Decimal,
    /// Human-readable explanation.
    pub reason: String,
    /// True if a cancel-by-side was issued (or would be, in a dry run).
    pub cancel_requested: bool,
    /// Orders the gateway reported cancelled.
    pub cancelled_orders: usize,
}

impl CircuitBreakerCheck {
    /// The blocked side, if any.
    #[must_use]
    pub fn blocked_side(&self) -> Option<OutcomeSide> {
        if self.should_block_up {
            Some(OutcomeSide::Up)
        } else if self.should_block_down {
            Some(OutcomeSide::Down)
        } else {
            None
        }
    }
}

/// Result of [`CircuitBreaker::emergency_cancel`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmergencyCancelReport {
    /// Orders found across both tokens.
    pub requested: usize,
    /// Orders cancelled.
    pub cancelled: usize,
    /// Orders whose cancel call failed.
    pub failed: usize,
    /// IDs of orders that failed to cancel.
    pub failed_order_ids: Vec<String>,
    /// Tokens whose open orders could not be listed.
    pub unlisted_tokens: Vec<String>,
    /// True if nothing was sent to the gateway.
    pub dry_run: bool,
}

/// Per-market block entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarketBlock {
    /// Side whose new quotes are blocked.
    pub blocked_side: OutcomeSide,
    /// Current severity.
    pub level: SafetyLevel,
    /// Number of checks at Critical or above since the block was created.
    pub violation_count: u32,
    /// When the block was created.
    pub first_breach_at: DateTime<Utc>,
    /// Imbalance at the last check.
    pub last_imbalance: Decimal,
    /// Highest level at which the current side was cancelled.
    #[serde(skip)]
    cancelled_at: Option<(OutcomeSide, SafetyLevel)>,
}

/// Snapshot of engine-level breaker state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerState {
    /// True while any market sits at the Extreme level.
    pub tripped: bool,
    /// Reason for the most recent trip.
    pub reason: Option<String>,
    /// Imbalance seen by the most recent check.
    pub last_imbalance: Decimal,
    /// Markets currently blocked.
    pub blocked_markets: usize,
}

// =============================================================================
// Circuit Breaker
// =============================================================================

#[derive(Debug)]
struct BreakerInner {
    tripped: bool,
    reason: Option<String>,
    last_imbalance: Decimal,
    blocks: HashMap<String, MarketBlock>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            tripped: false,
            reason: None,
            last_imbalance: Decimal::ZERO,
            blocks: HashMap::new(),
        }
    }
}

/// Per-market imbalance state machine.
///
/// Thread-safe: state lives behind a `parking_lot::RwLock` that is never
/// held across an `.await`, so distinct markets can be checked concurrently.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: RwLock<BreakerInner>,
    gateway: Arc<dyn OrderGateway>,
    events: broadcast::Sender<BreakerEvent>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("tripped", &state.tripped)
            .field("blocked_markets", &state.blocks.len())
            .finish()
    }
}

impl CircuitBreaker {
    /// Creates a breaker that cancels through `gateway`.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig, gateway: Arc<dyn OrderGateway>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            state: RwLock::new(BreakerInner::new()),
            gateway,
            events,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Subscribes to breaker events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: BreakerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Evaluates one market and applies the resulting block/cancel policy.
    ///
    /// With `dry_run`, cancellations are logged but not sent.
    pub async fn check_market(&self, exposure: &MarketExposure<'_>, dry_run: bool) -> CircuitBreakerCheck {
        let market_id = exposure.market.market_id.as_str();
        let imbalance = exposure.imbalance();
        let level = SafetyLevel::classify(imbalance, &self.config);
        let mut pending_events = Vec::new();

        let (blocked, reason, cancel_side) = {
            let mut state = self.state.write();
            state.last_imbalance = imbalance;

            let outcome = match exposure.leading_side() {
                Some(side) if level != SafetyLevel::Ok => {
                    self.escalate(&mut state, market_id, side, level, imbalance, &mut pending_events)
                }
                _ => {
                    if let Some(block) = state.blocks.remove(market_id) {
                        info!(
                            market_id,
                            side = %block.blocked_side,
                            %imbalance,
                            "Market rebalanced, block cleared"
                        );
                        pending_events.push(BreakerEvent::MarketUnblocked {
                            market_id: market_id.to_string(),
                            imbalance: Some(imbalance),
                        });
                    }
                    let reason = format!(
                        "balanced: imbalance {imbalance} < warning {}",
                        self.config.warning_threshold
                    );
                    (None, reason, None)
                }
            };

            let was_tripped = state.tripped;
            state.tripped = state.blocks.values().any(|b| b.level == SafetyLevel::Extreme);
            if state.tripped && !was_tripped {
                state.reason = Some(outcome.1.clone());
                pending_events.push(BreakerEvent::Tripped {
                    market_id: market_id.to_string(),
                    reason: outcome.1.clone(),
                    at: Utc::now(),
                });
            } else if !state.tripped {
                state.reason = None;
            }
            outcome
        };

        for event in pending_events {
            self.emit(event);
        }

        let mut cancelled_orders = 0;
        if let Some(side) = cancel_side {
            let token_id = exposure.market.token_for(side);
            if dry_run {
                info!(market_id, %side, token_id, "[DRY RUN] Would cancel resting orders");
            } else {
                match self.gateway.cancel_side(market_id, token_id).await {
                    Ok(n) => {
                        cancelled_orders = n;
                        info!(market_id, %side, cancelled = n, "Cancelled leading side orders");
                    }
                    Err(e) => {
                        warn!(market_id, %side, error = %e, "Cancel-by-side failed");
                    }
                }
            }
        }

        CircuitBreakerCheck {
            should_stop: false,
            should_block_up: blocked == Some(OutcomeSide::Up),
            should_block_down: blocked == Some(OutcomeSide::Down),
            level,
            imbalance,
            reason,
            cancel_requested: cancel_side.is_some(),
            cancelled_orders,
        }
    }

    /// Creates or updates the block for a breaching market.
    ///
    /// Returns `(blocked side, reason, side to cancel)`.
    fn escalate(
        &self,
        state: &mut BreakerInner,
        market_id: &str,
        side: OutcomeSide,
        level: SafetyLevel,
        imbalance: Decimal,
        pending_events: &mut Vec<BreakerEvent>,
    ) -> (Option<OutcomeSide>, String, Option<OutcomeSide>) {
        let block = state
            .blocks
            .entry(market_id.to_string())
            .or_insert_with(|| MarketBlock {
                blocked_side: side,
                level: SafetyLevel::Ok,
                violation_count: 0,
                first_breach_at: Utc::now(),
                last_imbalance: imbalance,
                cancelled_at: None,
            });

        let changed = block.level != level || block.blocked_side != side;
        if block.blocked_side != side {
            block.cancelled_at = None;
        }
        block.blocked_side = side;
        block.level = level;
        block.last_imbalance = imbalance;

        let mut cancel = None;
        if level.cancels_orders() {
            block.violation_count += 1;
            let already = block
                .cancelled_at
                .is_some_and(|(s, l)| s == side && l >= level);
            if !already {
                block.cancelled_at = Some((side, level));
                cancel = Some(side);
            }
        }

        let lagging = side.opposite();
        let reason = match level {
            SafetyLevel::Warning => format!(
                "WARNING: {side} leads by {imbalance} (>= {}); new {side} quotes blocked",
                self.config.warning_threshold
            ),
            SafetyLevel::Critical => format!(
                "CRITICAL: {side} leads by {imbalance} (>= {}); {side} orders cancelled, violation #{}",
                self.config.critical_threshold, block.violation_count
            ),
            SafetyLevel::Extreme => format!(
                "EXTREME: {side} leads by {imbalance} (>= {}); {side} blocked until rebalanced, {lagging} keeps trading",
                self.config.absolute_max_unpaired
            ),
            SafetyLevel::Ok => String::new(),
        };

        if changed {
            match level {
                SafetyLevel::Warning => warn!(market_id, %side, %imbalance, "Imbalance warning"),
                _ => error!(market_id, %side, safety = %level, %imbalance, violations = block.violation_count, "Imbalance breach"),
            }
            pending_events.push(BreakerEvent::MarketBlocked {
                market_id: market_id.to_string(),
                side,
                level,
                imbalance,
            });
        } else {
            debug!(market_id, %side, safety = %level, %imbalance, "Imbalance block unchanged");
        }

        (Some(side), reason, cancel)
    }

    /// Cancels every resting order on both of a market's tokens.
    ///
    /// Cancels are issued one at a time with `cancel_delay` between calls.
    /// Individual failures are logged and counted; the batch always runs to
    /// completion.
    ///
    /// # Errors
    ///
    /// Returns the last listing error if open orders could be fetched for
    /// neither token.
    pub async fn emergency_cancel(
        &self,
        market: &MarketDescriptor,
        dry_run: bool,
    ) -> Result<EmergencyCancelReport, GatewayError> {
        let mut report = EmergencyCancelReport {
            dry_run,
            ..EmergencyCancelReport::default()
        };
        let mut orders = Vec::new();
        let mut last_error = None;

        for token_id in [&market.up_token_id, &market.down_token_id] {
            match self.gateway.open_orders(token_id).await {
                Ok(found) => orders.extend(found),
                Err(e) => {
                    warn!(market_id = %market.market_id, token_id = %token_id, error = %e, "Failed to list open orders");
                    report.unlisted_tokens.push(token_id.clone());
                    last_error = Some(e);
                }
            }
        }

        if report.unlisted_tokens.len() == 2 {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        report.requested = orders.len();
        if dry_run {
            info!(market_id = %market.market_id, orders = orders.len(), "[DRY RUN] Would emergency-cancel");
            return Ok(report);
        }

        for (i, order) in orders.iter().enumerate() {
            if i > 0 && !self.config.cancel_delay.is_zero() {
                tokio::time::sleep(self.config.cancel_delay).await;
            }
            match self.gateway.cancel_order(&order.order_id).await {
                Ok(()) => report.cancelled += 1,
                Err(e) => {
                    warn!(order_id = %order.order_id, error = %e, "Emergency cancel failed, continuing");
                    report.failed += 1;
                    report.failed_order_ids.push(order.order_id.clone());
                }
            }
        }

        info!(
            market_id = %market.market_id,
            requested = report.requested,
            cancelled = report.cancelled,
            failed = report.failed,
            "Emergency cancel complete"
        );
        Ok(report)
    }

    /// Clears all breaker state.
    pub fn reset(&self) {
        *self.state.write() = BreakerInner::new();
        info!("Circuit breaker reset");
        self.emit(BreakerEvent::Reset { at: Utc::now() });
    }

    /// Clears one market's block. Returns true if a block existed.
    pub fn clear_market_block(&self, market_id: &str) -> bool {
        let removed = {
            let mut state = self.state.write();
            let removed = state.blocks.remove(market_id).is_some();
            state.tripped = state.blocks.values().any(|b| b.level == SafetyLevel::Extreme);
            if !state.tripped {
                state.reason = None;
            }
            removed
        };
        if removed {
            info!(market_id, "Market block cleared manually");
            self.emit(BreakerEvent::MarketUnblocked {
                market_id: market_id.to_string(),
                imbalance: None,
            });
        }
        removed
    }

    /// Returns true if new quotes on `side` are currently blocked in `market_id`.
    #[must_use]
    pub fn is_side_blocked(&self, market_id: &str, side: OutcomeSide) -> bool {
        self.state
            .read()
            .blocks
            .get(market_id)
            .is_some_and(|b| b.blocked_side == side)
    }

    /// Current block for a market, if any.
    #[must_use]
    pub fn market_block(&self, market_id: &str) -> Option<MarketBlock> {
        self.state.read().blocks.get(market_id).cloned()
    }

    /// IDs of all blocked markets.
    #[must_use]
    pub fn blocked_markets(&self) -> Vec<String> {
        self.state.read().blocks.keys().cloned().collect()
    }

    /// Snapshot of engine-level state.
    #[must_use]
    pub fn state(&self) -> CircuitBreakerState {
        let state = self.state.read();
        CircuitBreakerState {
            tripped: state.tripped,
            reason: state.reason.clone(),
            last_imbalance: state.last_imbalance,
            blocked_markets: state.blocks.len(),
        }
    }
}

// =============================================================================
// Serde support for Duration
// =============================================================================

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::OpenOrder;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingGateway {
        side_cancels: Mutex<Vec<String>>,
        order_cancels: Mutex<Vec<String>>,
        open: Mutex<HashMap<String, Vec<OpenOrder>>>,
        failing_orders: Vec<String>,
        failing_listings: Vec<String>,
        fail_side_cancel: bool,
    }

    impl RecordingGateway {
        fn with_orders(token_id: &str, ids: &[&str]) -> Self {
            let gateway = Self::default();
            gateway.add_orders(token_id, ids);
            gateway
        }

        fn add_orders(&self, token_id: &str, ids: &[&str]) {
            let orders = ids
                .iter()
                .map(|id| OpenOrder {
                    order_id: (*id).to_string(),
                    token_id: token_id.to_string(),
                    side: None,
                    price: dec!(0.45),
                    size: dec!(10),
                })
                .collect();
            self.open.lock().insert(token_id.to_string(), orders);
        }
    }

    #[async_trait]
    impl OrderGateway for RecordingGateway {
        async fn cancel_side(&self, _market_id: &str, token_id: &str) -> Result<usize, GatewayError> {
            self.side_cancels.lock().push(token_id.to_string());
            if self.fail_side_cancel {
                return Err(GatewayError::Network("connection reset".into()));
            }
            Ok(2)
        }

        async fn open_orders(&self, token_id: &str) -> Result<Vec<OpenOrder>, GatewayError> {
            if self.failing_listings.iter().any(|t| t == token_id) {
                return Err(GatewayError::Api("listing failed".into()));
            }
            Ok(self.open.lock().get(token_id).cloned().unwrap_or_default())
        }

        async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
            self.order_cancels.lock().push(order_id.to_string());
            if self.failing_orders.iter().any(|o| o == order_id) {
                return Err(GatewayError::OrderNotFound(order_id.to_string()));
            }
            Ok(())
        }
    }

    fn market() -> MarketDescriptor {
        MarketDescriptor::new("m1", "BTC", "up-tok", "down-tok")
    }

    fn breaker_with(gateway: Arc<RecordingGateway>) -> CircuitBreaker {
        let config = CircuitBreakerConfig::default().with_cancel_delay(Duration::from_millis(1));
        CircuitBreaker::new(config, gateway)
    }

    // ==================== Configuration Tests ====================

    #[test]
    fn test_config_default_values() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.warning_threshold, dec!(10));
        assert_eq!(config.critical_threshold, dec!(15));
        assert_eq!(config.absolute_max_unpaired, dec!(20));
        assert_eq!(config.cancel_delay, Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validate_ordering() {
        let bad = CircuitBreakerConfig::default().with_thresholds(dec!(15), dec!(10), dec!(20));
        assert!(bad.validate().is_err());

        let bad = CircuitBreakerConfig::default().with_thresholds(dec!(10), dec!(20), dec!(20));
        assert!(bad.validate().is_err());

        let bad = CircuitBreakerConfig::default().with_thresholds(dec!(0), dec!(5), dec!(10));
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_config_cancel_delay_serializes_as_millis() {
        let config = CircuitBreakerConfig::default().with_cancel_delay(Duration::from_millis(250));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["cancel_delay"], 250);

        let back: CircuitBreakerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.cancel_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_classify_levels() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(SafetyLevel::classify(dec!(9.99), &config), SafetyLevel::Ok);
        assert_eq!(SafetyLevel::classify(dec!(10), &config), SafetyLevel::Warning);
        assert_eq!(SafetyLevel::classify(dec!(15), &config), SafetyLevel::Critical);
        assert_eq!(SafetyLevel::classify(dec!(20), &config), SafetyLevel::Extreme);
        assert_eq!(SafetyLevel::classify(dec!(500), &config), SafetyLevel::Extreme);
    }

    // ==================== State Machine Tests ====================

    #[tokio::test]
    async fn test_balanced_market_is_not_blocked() {
        let gateway = Arc::new(RecordingGateway::default());
        let breaker = breaker_with(gateway.clone());
        let market = market();

        let check = breaker
            .check_market(&MarketExposure::new(&market, dec!(30), dec!(25)), false)
            .await;

        assert_eq!(check.level, SafetyLevel::Ok);
        assert!(!check.should_block_up);
        assert!(!check.should_block_down);
        assert!(!check.should_stop);
        assert!(breaker.market_block("m1").is_none());
        assert!(gateway.side_cancels.lock().is_empty());
    }

    #[tokio::test]
    async fn test_warning_blocks_leading_side_without_cancel() {
        let gateway = Arc::new(RecordingGateway::default());
        let breaker = breaker_with(gateway.clone());
        let market = market();

        let check = breaker
            .check_market(&MarketExposure::new(&market, dec!(0), dec!(12)), false)
            .await;

        assert_eq!(check.level, SafetyLevel::Warning);
        assert!(check.should_block_down);
        assert!(!check.should_block_up);
        assert!(!check.cancel_requested);
        assert!(gateway.side_cancels.lock().is_empty());
        assert!(breaker.is_side_blocked("m1", OutcomeSide::Down));
        assert!(!breaker.is_side_blocked("m1", OutcomeSide::Up));
    }

    #[tokio::test]
    async fn test_critical_cancels_leading_side_once() {
        let gateway = Arc::new(RecordingGateway::default());
        let breaker = breaker_with(gateway.clone());
        let market = market();
        let exposure = MarketExposure::new(&market, dec!(16), dec!(0));

        let first = breaker.check_market(&exposure, false).await;
        assert_eq!(first.level, SafetyLevel::Critical);
        assert!(first.cancel_requested);
        assert_eq!(first.cancelled_orders, 2);

        let second = breaker.check_market(&exposure, false).await;
        assert!(!second.cancel_requested);
        assert!(second.should_block_up);
        assert!(!second.should_stop);

        assert_eq!(gateway.side_cancels.lock().as_slice(), ["up-tok"]);
        assert_eq!(breaker.market_block("m1").unwrap().violation_count, 2);
    }

    #[tokio::test]
    async fn test_escalation_to_extreme_cancels_again() {
        let gateway = Arc::new(RecordingGateway::default());
        let breaker = breaker_with(gateway.clone());
        let market = market();

        breaker
            .check_market(&MarketExposure::new(&market, dec!(16), dec!(0)), false)
            .await;
        let extreme = breaker
            .check_market(&MarketExposure::new(&market, dec!(25), dec!(0)), false)
            .await;

        assert_eq!(extreme.level, SafetyLevel::Extreme);
        assert!(extreme.cancel_requested);
        assert_eq!(gateway.side_cancels.lock().len(), 2);
        assert!(breaker.state().tripped);
    }

    #[tokio::test]
    async fn test_extreme_then_rebalance_clears_block() {
        let gateway = Arc::new(RecordingGateway::default());
        let breaker = breaker_with(gateway.clone());
        let market = market();

        let check = breaker
            .check_market(&MarketExposure::new(&market, dec!(25), dec!(0)), false)
            .await;
        assert!(check.should_block_up);
        assert!(!check.should_block_down);
        assert!(!check.should_stop);
        assert!(check.reason.contains("DOWN keeps trading"));

        let check = breaker
            .check_market(&MarketExposure::new(&market, dec!(25), dec!(20)), false)
            .await;
        assert_eq!(check.level, SafetyLevel::Ok);
        assert!(!check.should_block_up);
        assert!(breaker.market_block("m1").is_none());
        assert!(!breaker.state().tripped);
    }

    #[tokio::test]
    async fn test_untrip_clears_reason() {
        let breaker = breaker_with(Arc::new(RecordingGateway::default()));
        let market = market();

        breaker
            .check_market(&MarketExposure::new(&market, dec!(25), dec!(0)), false)
            .await;
        assert!(breaker.state().tripped);
        assert!(breaker.state().reason.is_some());

        breaker
            .check_market(&MarketExposure::new(&market, dec!(25), dec!(20)), false)
            .await;
        let state = breaker.state();
        assert!(!state.tripped);
        assert!(state.reason.is_none());
    }

    #[tokio::test]
    async fn test_leading_side_flip_moves_block_and_cancels() {
        let gateway = Arc::new(RecordingGateway::default());
        let breaker = breaker_with(gateway.clone());
        let market = market();

        breaker
            .check_market(&MarketExposure::new(&market, dec!(16), dec!(0)), false)
            .await;
        let flipped = breaker
            .check_market(&MarketExposure::new(&market, dec!(0), dec!(16)), false)
            .await;

        assert!(flipped.should_block_down);
        assert!(!flipped.should_block_up);
        assert!(flipped.cancel_requested);
        assert_eq!(gateway.side_cancels.lock().as_slice(), ["up-tok", "down-tok"]);
    }

    #[tokio::test]
    async fn test_dry_run_sends_nothing() {
        let gateway = Arc::new(RecordingGateway::default());
        let breaker = breaker_with(gateway.clone());
        let market = market();

        let check = breaker
            .check_market(&MarketExposure::new(&market, dec!(30), dec!(0)), true)
            .await;

        assert!(check.cancel_requested);
        assert_eq!(check.cancelled_orders, 0);
        assert!(gateway.side_cancels.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_failure_keeps_block() {
        let gateway = Arc::new(RecordingGateway {
            fail_side_cancel: true,
            ..RecordingGateway::default()
        });
        let breaker = breaker_with(gateway.clone());
        let market = market();

        let check = breaker
            .check_market(&MarketExposure::new(&market, dec!(18), dec!(0)), false)
            .await;

        assert!(check.should_block_up);
        assert_eq!(check.cancelled_orders, 0);
        assert_eq!(gateway.side_cancels.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_never_stops_and_never_blocks_both() {
        let gateway = Arc::new(RecordingGateway::default());
        let breaker = breaker_with(gateway);
        let market = market();

        for up in 0..40 {
            for down in (0..40).step_by(7) {
                let check = breaker
                    .check_market(
                        &MarketExposure::new(&market, Decimal::from(up), Decimal::from(down)),
                        true,
                    )
                    .await;
                assert!(!check.should_stop);
                assert!(!(check.should_block_up && check.should_block_down));
                if check.should_block_up {
                    assert!(up > down);
                }
                if check.should_block_down {
                    assert!(down > up);
                }
            }
        }
    }

    // ==================== Manual Override Tests ====================

    #[tokio::test]
    async fn test_reset_and_clear_market_block() {
        let gateway = Arc::new(RecordingGateway::default());
        let breaker = breaker_with(gateway);
        let market = market();
        let other = MarketDescriptor::new("m2", "ETH", "u2", "d2");

        breaker
            .check_market(&MarketExposure::new(&market, dec!(25), dec!(0)), true)
            .await;
        breaker
            .check_market(&MarketExposure::new(&other, dec!(11), dec!(0)), true)
            .await;
        assert_eq!(breaker.blocked_markets().len(), 2);

        assert!(breaker.clear_market_block("m1"));
        assert!(!breaker.clear_market_block("m1"));
        assert!(!breaker.state().tripped);
        assert_eq!(breaker.blocked_markets(), vec!["m2".to_string()]);

        breaker.reset();
        let state = breaker.state();
        assert_eq!(state.blocked_markets, 0);
        assert!(!state.tripped);
        assert!(state.reason.is_none());
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let gateway = Arc::new(RecordingGateway::default());
        let breaker = breaker_with(gateway);
        let market = market();
        let mut rx = breaker.subscribe();

        breaker
            .check_market(&MarketExposure::new(&market, dec!(21), dec!(0)), true)
            .await;
        breaker
            .check_market(&MarketExposure::new(&market, dec!(21), dec!(21)), true)
            .await;

        match rx.recv().await.unwrap() {
            BreakerEvent::MarketBlocked { side, level, .. } => {
                assert_eq!(side, OutcomeSide::Up);
                assert_eq!(level, SafetyLevel::Extreme);
            }
            other => panic!("Expected MarketBlocked, got {other:?}"),
        }
        assert!(matches!(rx.recv().await.unwrap(), BreakerEvent::Tripped { .. }));
        match rx.recv().await.unwrap() {
            BreakerEvent::MarketUnblocked { market_id, imbalance } => {
                assert_eq!(market_id, "m1");
                assert_eq!(imbalance, Some(Decimal::ZERO));
            }
            other => panic!("Expected MarketUnblocked, got {other:?}"),
        }
    }

    // ==================== Emergency Cancel Tests ====================

    #[tokio::test]
    async fn test_emergency_cancel_runs_whole_batch() {
        let gateway = RecordingGateway {
            failing_orders: vec!["o2".to_string()],
            ..RecordingGateway::default()
        };
        gateway.add_orders("up-tok", &["o1", "o2"]);
        gateway.add_orders("down-tok", &["o3"]);
        let gateway = Arc::new(gateway);
        let breaker = breaker_with(gateway.clone());

        let report = breaker.emergency_cancel(&market(), false).await.unwrap();

        assert_eq!(report.requested, 3);
        assert_eq!(report.cancelled, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.failed_order_ids, vec!["o2".to_string()]);
        assert_eq!(gateway.order_cancels.lock().as_slice(), ["o1", "o2", "o3"]);
    }

    #[tokio::test]
    async fn test_emergency_cancel_dry_run() {
        let gateway = Arc::new(RecordingGateway::with_orders("up-tok", &["o1"]));
        let breaker = breaker_with(gateway.clone());

        let report = breaker.emergency_cancel(&market(), true).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.requested, 1);
        assert_eq!(report.cancelled, 0);
        assert!(gateway.order_cancels.lock().is_empty());
    }

    #[tokio::test]
    async fn test_emergency_cancel_partial_listing_failure() {
        let gateway = RecordingGateway {
            failing_listings: vec!["up-tok".to_string()],
            ..RecordingGateway::default()
        };
        gateway.add_orders("down-tok", &["o3"]);
        let breaker = breaker_with(Arc::new(gateway));

        let report = breaker.emergency_cancel(&market(), false).await.unwrap();
        assert_eq!(report.unlisted_tokens, vec!["up-tok".to_string()]);
        assert_eq!(report.cancelled, 1);
    }

    #[tokio::test]
    async fn test_emergency_cancel_total_listing_failure_is_error() {
        let gateway = RecordingGateway {
            failing_listings: vec!["up-tok".to_string(), "down-tok".to_string()],
            ..RecordingGateway::default()
        };
        let breaker = breaker_with(Arc::new(gateway));

        let result = breaker.emergency_cancel(&market(), false).await;
        assert!(matches!(result, Err(GatewayError::Api(_))));
    }
}
