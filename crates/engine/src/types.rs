//! Shared types for paired-outcome markets.
//!
//! - [`OutcomeSide`]: which of the two complementary tokens (UP or DOWN)
//! - [`FillAction`]: whether a fill added to or reduced inventory
//! - [`MarketDescriptor`]: identifiers needed to quote and cancel in a market

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the two complementary outcome tokens of a binary market.
///
/// At settlement exactly one side redeems for $1.00, the other for $0.00.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutcomeSide {
    /// Pays out if the underlying closes above the window reference.
    Up,
    /// Pays out if the underlying closes at or below the window reference.
    Down,
}

impl OutcomeSide {
    /// Returns the complementary side.
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            OutcomeSide::Up => OutcomeSide::Down,
            OutcomeSide::Down => OutcomeSide::Up,
        }
    }
}

impl std::fmt::Display for OutcomeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeSide::Up => write!(f, "UP"),
            OutcomeSide::Down => write!(f, "DOWN"),
        }
    }
}

/// Direction of an executed fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FillAction {
    /// Shares acquired.
    Buy,
    /// Shares disposed of.
    Sell,
}

impl std::fmt::Display for FillAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FillAction::Buy => write!(f, "BUY"),
            FillAction::Sell => write!(f, "SELL"),
        }
    }
}

/// Identifiers for a single short-duration UP/DOWN market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDescriptor {
    /// Market condition ID.
    pub market_id: String,
    /// Underlying asset symbol (e.g. "BTC").
    pub asset: String,
    /// CLOB token ID of the UP outcome.
    pub up_token_id: String,
    /// CLOB token ID of the DOWN outcome.
    pub down_token_id: String,
    /// Window close time, if known.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl MarketDescriptor {
    /// Creates a descriptor without an expiry time.
    #[must_use]
    pub fn new(
        market_id: impl Into<String>,
        asset: impl Into<String>,
        up_token_id: impl Into<String>,
        down_token_id: impl Into<String>,
    ) -> Self {
        Self {
            market_id: market_id.into(),
            asset: asset.into(),
            up_token_id: up_token_id.into(),
            down_token_id: down_token_id.into(),
            expires_at: None,
        }
    }

    /// Sets the window close time.
    #[must_use]
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Returns the token ID for the given side.
    #[must_use]
    pub fn token_for(&self, side: OutcomeSide) -> &str {
        match side {
            OutcomeSide::Up => &self.up_token_id,
            OutcomeSide::Down => &self.down_token_id,
        }
    }

    /// Returns true if the window has closed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| now >= t)
    }
}
