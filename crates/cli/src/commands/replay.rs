//! Replays a recorded JSONL session through the engine.
//!
//! Each non-empty line is one tagged event:
//!
//! ```text
//! {"event":"register","market_id":"m1","asset":"BTC","up_token_id":"u","down_token_id":"d"}
//! {"event":"depth","market_id":"m1","up":{"bids":[[0.44,100]],"asks":[[0.46,100]]},"down":{...}}
//! {"event":"fill","market_id":"m1","asset":"BTC","side":"UP","action":"BUY","qty":"10","price":"0.45"}
//! {"event":"marks","market_id":"m1","up":"0.52"}
//! {"event":"settle","market_id":"m1","asset":"BTC","winning_side":"UP"}
//! {"event":"expire","market_id":"m1"}
//! ```
//!
//! Lines starting with `#` are comments. Cancellations are never sent.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Args;
use pairquote_engine::{
    FillEvent, GatewayError, GlobalPnL, MarketDepth, MarketDescriptor, OpenOrder, OrderGateway,
    PairEngine, PositionSnapshot, SettlementEvent, TokenDepth,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

use super::check_config::load_config;

/// Arguments for the replay command.
#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Config file path
    #[arg(short, long, default_value = "config/Config.toml", env = "PAIRQUOTE_CONFIG")]
    pub config: String,

    /// Recorded session (JSON lines)
    #[arg(short, long)]
    pub events: String,

    /// Profile overlay (loads Config.<profile>.toml from the same directory)
    #[arg(short, long)]
    pub profile: Option<String>,
}

/// One recorded session event.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Start tracking a market.
    Register(MarketDescriptor),
    /// Depth snapshot for both tokens.
    Depth {
        market_id: String,
        #[serde(default)]
        up: TokenDepth,
        #[serde(default)]
        down: TokenDepth,
    },
    /// Executed fill.
    Fill(FillEvent),
    /// Mark prices for unrealized PnL.
    Marks {
        market_id: String,
        #[serde(default)]
        up: Option<Decimal>,
        #[serde(default)]
        down: Option<Decimal>,
    },
    /// Market resolution.
    Settle(SettlementEvent),
    /// Market window closed.
    Expire { market_id: String },
    /// Startup position snapshot.
    Reconcile { positions: Vec<PositionSnapshot> },
}

/// Counters for a finished replay.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub events: usize,
    pub ticks: usize,
    pub quoted_ticks: usize,
    pub blocked_ticks: usize,
    pub skipped: usize,
}

/// Gateway that logs instead of sending.
struct DryRunGateway;

#[async_trait]
impl OrderGateway for DryRunGateway {
    async fn cancel_side(&self, market_id: &str, token_id: &str) -> Result<usize, GatewayError> {
        info!(market_id, token_id, "[DRY RUN] cancel_side");
        Ok(0)
    }

    async fn open_orders(&self, _token_id: &str) -> Result<Vec<OpenOrder>, GatewayError> {
        Ok(Vec::new())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), GatewayError> {
        info!(order_id, "[DRY RUN] cancel_order");
        Ok(())
    }
}

/// Parses a session, skipping blank and comment lines.
pub fn parse_session(contents: &str) -> Result<Vec<SessionEvent>> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(i, line)| {
            serde_json::from_str(line).with_context(|| format!("Invalid event on line {}", i + 1))
        })
        .collect()
}

/// Applies events in order and returns the counters.
pub async fn replay(engine: &PairEngine, events: Vec<SessionEvent>) -> ReplaySummary {
    let mut summary = ReplaySummary::default();

    for event in events {
        summary.events += 1;
        match event {
            SessionEvent::Register(market) => engine.register_market(market),
            SessionEvent::Depth { market_id, up, down } => {
                let depth = MarketDepth { up, down };
                match engine.evaluate(&market_id, &depth, true).await {
                    Ok(tick) => {
                        summary.ticks += 1;
                        if tick.decision.blocked {
                            summary.blocked_ticks += 1;
                        } else if tick.decision.quote_count() > 0 {
                            summary.quoted_ticks += 1;
                        }
                        println!(
                            "{market_id} ask={} edge={} safety={} up={} down={} | {}",
                            tick.book.combined_best_ask,
                            tick.book.edge,
                            tick.safety.level,
                            tick.decision.up_quotes.len(),
                            tick.decision.down_quotes.len(),
                            tick.decision.reasoning
                        );
                    }
                    Err(e) => {
                        warn!(%market_id, error = %e, "Skipping depth event");
                        summary.skipped += 1;
                    }
                }
            }
            SessionEvent::Fill(fill) => {
                let outcome = engine.on_fill(&fill);
                if !outcome.applied {
                    summary.skipped += 1;
                }
            }
            SessionEvent::Marks { market_id, up, down } => engine.update_marks(&market_id, up, down),
            SessionEvent::Settle(settlement) => {
                if let Err(e) = engine.on_settlement(&settlement) {
                    warn!(market_id = %settlement.market_id, error = %e, "Skipping settlement");
                    summary.skipped += 1;
                }
            }
            SessionEvent::Expire { market_id } => {
                if let Err(e) = engine.expire_market(&market_id) {
                    warn!(%market_id, error = %e, "Skipping expiry");
                    summary.skipped += 1;
                }
            }
            SessionEvent::Reconcile { positions } => {
                engine.reconcile(&positions);
            }
        }
    }

    summary
}

/// Runs the replay command.
pub async fn run_replay(args: ReplayArgs) -> Result<()> {
    let config = load_config(&args.config, args.profile.as_deref())?;
    let contents = std::fs::read_to_string(&args.events)
        .with_context(|| format!("Failed to read session file: {}", args.events))?;
    let events = parse_session(&contents)?;

    info!(events = events.len(), path = %args.events, "Replaying session");

    let engine = PairEngine::new(config, Arc::new(DryRunGateway));
    let summary = replay(&engine, events).await;
    let pnl: GlobalPnL = engine.global_pnl();

    info!(
        events = summary.events,
        ticks = summary.ticks,
        quoted = summary.quoted_ticks,
        blocked = summary.blocked_ticks,
        skipped = summary.skipped,
        "Replay complete"
    );
    println!("{}", serde_json::to_string_pretty(&pnl)?);
    Ok(())
}
