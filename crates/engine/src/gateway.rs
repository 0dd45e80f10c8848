//! Order gateway seam.
//!
//! The engine never signs or transmits orders itself. Cancellation requests
//! from the circuit breaker go through [`OrderGateway`], implemented by the
//! execution layer (live CLOB client, paper executor, or a test double).

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::OutcomeSide;

/// A resting order as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOrder {
    /// Exchange order ID.
    pub order_id: String,
    /// Token the order rests on.
    pub token_id: String,
    /// Outcome side of the token, if the gateway knows it.
    #[serde(default)]
    pub side: Option<OutcomeSide>,
    /// Limit price.
    pub price: Decimal,
    /// Remaining size.
    pub size: Decimal,
}

/// Errors from gateway calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// Exchange rejected the request.
    #[error("API error: {0}")]
    Api(String),

    /// Network/connection failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded: retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Order is unknown or already terminal.
    #[error("Order not found: {0}")]
    OrderNotFound(String),
}

impl GatewayError {
    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Network(_) | GatewayError::RateLimited { .. }
        )
    }
}

/// Execution-layer operations the engine depends on.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Cancels every resting order on `token_id` in `market_id`.
    ///
    /// Returns the number of orders cancelled.
    async fn cancel_side(&self, market_id: &str, token_id: &str) -> Result<usize, GatewayError>;

    /// Lists resting orders on a token.
    async fn open_orders(&self, token_id: &str) -> Result<Vec<OpenOrder>, GatewayError>;

    /// Cancels one order by exchange ID.
    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError>;
}
