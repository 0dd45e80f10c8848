//! Circuit breaker notifications.
//!
//! Every transition is also returned directly from the call that caused it;
//! these events exist for owners that want a push feed (dashboards, alerting).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::circuit_breaker::SafetyLevel;
use crate::types::OutcomeSide;

/// Channel capacity for breaker event subscribers.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A circuit breaker state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BreakerEvent {
    /// A market reached the absolute unpaired limit.
    Tripped {
        /// Market that tripped the breaker.
        market_id: String,
        /// Human-readable reason.
        reason: String,
        /// When it happened.
        at: DateTime<Utc>,
    },
    /// Manual reset of all breaker state.
    Reset {
        /// When it happened.
        at: DateTime<Utc>,
    },
    /// A market's leading side was blocked, or its block escalated.
    MarketBlocked {
        /// Market condition ID.
        market_id: String,
        /// Side whose new quotes are blocked.
        side: OutcomeSide,
        /// Severity.
        level: SafetyLevel,
        /// |UP - DOWN| shares.
        imbalance: Decimal,
    },
    /// A market's block was cleared by rebalancing, manual override, or expiry.
    MarketUnblocked {
        /// Market condition ID.
        market_id: String,
        /// Imbalance at the time of clearing, if known.
        imbalance: Option<Decimal>,
    },
}

impl BreakerEvent {
    /// Market the event refers to, if any.
    #[must_use]
    pub fn market_id(&self) -> Option<&str> {
        match self {
            BreakerEvent::Tripped { market_id, .. }
            | BreakerEvent::MarketBlocked { market_id, .. }
            | BreakerEvent::MarketUnblocked { market_id, .. } => Some(market_id),
            BreakerEvent::Reset { .. } => None,
        }
    }
}
