//! Paired-outcome market making core for 15-minute UP/DOWN binary markets.
//!
//! This crate provides:
//! - Depth parsing and a combined UP+DOWN book with edge and pairable depth
//! - A paired bid ladder generator that only quotes while `UP + DOWN < $1.00`
//! - An imbalance circuit breaker that blocks the leading side and never halts
//! - An average-cost accounting ledger with settlement and mark-to-market PnL
//!
//! # Example
//!
//! ```
//! use pairquote_engine::{build_combined_book, generate_combined_quotes, QuoteConfig, RawLevel};
//! use rust_decimal_macros::dec;
//!
//! let bids: Vec<RawLevel> = vec![
//!     (dec!(0.44), dec!(100)).into(),
//!     (dec!(0.43), dec!(100)).into(),
//!     (dec!(0.42), dec!(100)).into(),
//! ];
//! let asks: Vec<RawLevel> = vec![
//!     (dec!(0.46), dec!(100)).into(),
//!     (dec!(0.47), dec!(100)).into(),
//!     (dec!(0.48), dec!(100)).into(),
//! ];
//!
//! let book = build_combined_book(&bids, &asks, &bids, &asks);
//! assert_eq!(book.edge, dec!(0.08));
//!
//! let decision = generate_combined_quotes(&book, &QuoteConfig::default());
//! assert!(!decision.blocked);
//! ```

pub mod circuit_breaker;
pub mod combined_book;
pub mod config;
pub mod depth;
pub mod engine;
pub mod events;
pub mod gateway;
pub mod ledger;
pub mod quoting;
pub mod types;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerCheck, CircuitBreakerConfig, CircuitBreakerState,
    EmergencyCancelReport, MarketBlock, MarketExposure, SafetyLevel,
};
pub use combined_book::{
    analyze_depth_for_pairing, build_combined_book, vwap_for_size, CombinedBook, CombinedBookBuilder,
    PairingAnalysis, PairingSearch,
};
pub use config::{ConfigError, ConfigLoader, EngineConfig};
pub use depth::{build_side_book, parse_depth_levels, DepthLevel, RawLevel, RawNumber, SideBook};
pub use engine::{EngineError, MarketDepth, PairEngine, TickOutcome, TokenDepth};
pub use events::BreakerEvent;
pub use gateway::{GatewayError, OpenOrder, OrderGateway};
pub use ledger::{
    AccountingEntry, AccountingLedger, FillEvent, FillOutcome, GlobalPnL, MarketPnL, PositionSnapshot,
    SettlementEvent, SettlementOutcome,
};
pub use quoting::{generate_combined_quotes, BlockReason, Quote, QuoteConfig, QuotingDecision};
pub use types::{FillAction, MarketDescriptor, OutcomeSide};
