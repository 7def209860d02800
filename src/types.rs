//! Core Domain Types
//!
//! Shared types for the market-making core. All prices and quantities are
//! IEEE-754 doubles; NaN/Inf are rejected at the input boundary and
//! comparisons are tolerant to signed zero.

use crate::clock::Nanos;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Unique identifier for orders, monotonically non-decreasing for process lifetime.
pub type OrderId = u64;

/// Price in quote currency units (e.g. USD for BTC-USD).
pub type Price = f64;

/// Size/quantity in base currency units.
pub type Qty = f64;

/// Signed net position in base currency units.
pub type Position = f64;

/// Smallest price increment.
pub const TICK_SIZE: f64 = 0.01;

/// Maker fee rate as a fraction of notional (venue pays no maker fee).
pub const MAKER_FEE_RATE: f64 = 0.0;

/// Taker fee rate as a fraction of notional.
pub const TAKER_FEE_RATE: f64 = 0.0005;

/// Default time-to-live for resting orders, in seconds.
pub const DEFAULT_ORDER_TTL_SEC: u64 = 120;

/// Samples retained per latency class.
pub const LATENCY_WINDOW_SIZE: usize = 1024;

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[inline]
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    #[inline]
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// Book side for ladder selection (bids hold buys, asks hold sells).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookSide {
    Bid,
    Ask,
}

impl From<Side> for BookSide {
    #[inline]
    fn from(side: Side) -> Self {
        match side {
            Side::Buy => BookSide::Bid,
            Side::Sell => BookSide::Ask,
        }
    }
}

/// Lifecycle status of one of our orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Created, not yet sent.
    Pending,
    /// Sent to the venue, awaiting acknowledgment.
    Submitted,
    /// Venue confirmed receipt; order is live.
    Acknowledged,
    /// Some quantity executed, remainder live.
    PartiallyFilled,
    /// Fully executed.
    Filled,
    /// Cancel requested, awaiting confirmation.
    Cancelling,
    /// Cancelled.
    Cancelled,
    /// Venue or risk gate rejected the order.
    Rejected,
    /// Time-to-live elapsed before a terminal venue event.
    Expired,
}

impl OrderStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::Submitted
                | OrderStatus::Acknowledged
                | OrderStatus::PartiallyFilled
                | OrderStatus::Cancelling
        )
    }

    #[inline]
    pub fn can_cancel(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending
                | OrderStatus::Submitted
                | OrderStatus::Acknowledged
                | OrderStatus::PartiallyFilled
        )
    }
}

/// Outcome of matching an incoming order against the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchResult {
    /// Nothing crossed; limit remainder rests.
    NoMatch,
    /// Part of the order executed.
    PartialFill,
    /// The whole order executed.
    FullFill,
    /// Order failed validation; no state was mutated.
    Rejected,
}

/// Outcome of the pre-trade risk gate, in check order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskCheckResult {
    Approved,
    PositionLimitExceeded,
    DailyLossLimitExceeded,
    DrawdownLimitExceeded,
    ConcentrationRisk,
    VarLimitExceeded,
    OrderRateLimitExceeded,
    LatencyLimitExceeded,
    CriticalBreach,
}

impl RiskCheckResult {
    #[inline]
    pub fn approved(&self) -> bool {
        matches!(self, RiskCheckResult::Approved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskCheckResult::Approved => "APPROVED",
            RiskCheckResult::PositionLimitExceeded => "POSITION_LIMIT_EXCEEDED",
            RiskCheckResult::DailyLossLimitExceeded => "DAILY_LOSS_LIMIT_EXCEEDED",
            RiskCheckResult::DrawdownLimitExceeded => "DRAWDOWN_LIMIT_EXCEEDED",
            RiskCheckResult::ConcentrationRisk => "CONCENTRATION_RISK",
            RiskCheckResult::VarLimitExceeded => "VAR_LIMIT_EXCEEDED",
            RiskCheckResult::OrderRateLimitExceeded => "ORDER_RATE_LIMIT_EXCEEDED",
            RiskCheckResult::LatencyLimitExceeded => "LATENCY_LIMIT_EXCEEDED",
            RiskCheckResult::CriticalBreach => "CRITICAL_BREACH",
        }
    }
}

/// One of our order intents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub side: Side,
    pub price: Price,
    pub original_quantity: Qty,
    pub remaining_quantity: Qty,
    pub status: OrderStatus,
    pub entry_time: Nanos,
    pub last_update_time: Nanos,
    /// Mid price snapshot at creation, for slippage analysis.
    pub mid_price_at_entry: Price,
}

impl Default for Order {
    fn default() -> Self {
        Self {
            order_id: 0,
            side: Side::Buy,
            price: 0.0,
            original_quantity: 0.0,
            remaining_quantity: 0.0,
            status: OrderStatus::Pending,
            entry_time: 0,
            last_update_time: 0,
            mid_price_at_entry: 0.0,
        }
    }
}

impl Order {
    pub fn new(order_id: OrderId, side: Side, price: Price, quantity: Qty, now: Nanos) -> Self {
        Self {
            order_id,
            side,
            price,
            original_quantity: quantity,
            remaining_quantity: quantity,
            status: OrderStatus::Pending,
            entry_time: now,
            last_update_time: now,
            mid_price_at_entry: 0.0,
        }
    }
}

/// A single aggregate price level, as published by the feed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub price: Price,
    pub quantity: Qty,
}

impl Level {
    #[inline]
    pub fn new(price: Price, quantity: Qty) -> Self {
        Self { price, quantity }
    }
}

/// How a depth record should be applied to the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepthKind {
    /// Replace the covered side(s) wholesale.
    Snapshot,
    /// Per-level quantity updates; a zero quantity removes the level.
    Update,
}

/// Level-2 depth record from the external feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDepth {
    pub kind: DepthKind,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub timestamp: Nanos,
}

impl MarketDepth {
    pub fn snapshot(bids: Vec<Level>, asks: Vec<Level>, timestamp: Nanos) -> Self {
        Self {
            kind: DepthKind::Snapshot,
            bids,
            asks,
            timestamp,
        }
    }

    pub fn update(bids: Vec<Level>, asks: Vec<Level>, timestamp: Nanos) -> Self {
        Self {
            kind: DepthKind::Update,
            bids,
            asks,
            timestamp,
        }
    }
}

/// One match or inferred fill. `passive_order_id == 0` marks liquidity that
/// belongs to the external replica rather than a tracked order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TradeExecution {
    pub trade_id: u64,
    pub aggressor_order_id: OrderId,
    pub passive_order_id: OrderId,
    pub price: Price,
    pub quantity: Qty,
    pub aggressor_side: Side,
    pub timestamp: Nanos,
}

/// Top-of-book snapshot. Zeroed sides mean the side is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TopOfBook {
    pub bid_price: Price,
    pub bid_quantity: Qty,
    pub ask_price: Price,
    pub ask_quantity: Qty,
    pub mid_price: Price,
    pub spread: Price,
    pub timestamp: Nanos,
}

/// Net position plus P&L bookkeeping.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PositionInfo {
    pub net_position: Position,
    /// Volume-weighted average entry price of the open position.
    pub avg_price: Price,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    /// Total open notional, long plus short.
    pub gross_exposure: f64,
    pub daily_volume: Qty,
    pub trade_count: u32,
    pub last_update: Nanos,
}

/// Risk bounds. Set at startup, hot-reloadable through the order manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Maximum absolute net position, base units.
    pub max_position: Position,
    /// Maximum realized daily loss, quote units.
    pub max_daily_loss: f64,
    /// Maximum drawdown from peak equity, fraction.
    pub max_drawdown: f64,
    /// Maximum projected notional as a fraction of capital base.
    pub position_concentration: f64,
    /// Value-at-risk cap, quote units.
    pub var_limit: f64,
    /// Sliding one-second order rate cap.
    pub max_orders_per_second: u32,
    /// Reject new orders when recent p95 placement latency exceeds this.
    pub max_latency_ms: f64,
    /// Capital base used for concentration checks, quote units.
    pub capital_base: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position: 0.5,
            max_daily_loss: 1000.0,
            max_drawdown: 0.05,
            position_concentration: 0.3,
            var_limit: 500.0,
            max_orders_per_second: 100,
            max_latency_ms: 50.0,
            capital_base: 10_000.0,
        }
    }
}

/// Aggregate book-engine counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct OrderBookStats {
    pub total_orders_processed: u64,
    pub total_trades: u64,
    /// External depth records applied.
    pub total_updates: u64,
    /// Malformed depth records dropped.
    pub dropped_updates: u64,
    /// Invalid orders rejected at validation.
    pub rejected_orders: u64,
    pub total_volume: Qty,
    pub last_trade_time: Nanos,
    /// Running mean of observed spread in basis points.
    pub avg_spread_bps: f64,
}

/// Validate a price for book entry: finite and strictly positive.
#[inline]
pub fn is_valid_price(price: Price) -> bool {
    price.is_finite() && price > 0.0
}

/// Validate a quantity for book entry: finite and strictly positive.
#[inline]
pub fn is_valid_quantity(quantity: Qty) -> bool {
    quantity.is_finite() && quantity > 0.0
}

/// Spread in basis points of the mid.
#[inline]
pub fn spread_bps(bid: Price, ask: Price) -> f64 {
    let mid = (bid + ask) / 2.0;
    if mid <= 0.0 {
        return 0.0;
    }
    (ask - bid) / mid * 10_000.0
}

// =============================================================================
// COMPONENT SEAMS
//
// The book engine and the order manager reference each other; the cycle is
// broken by these two capabilities. Each side is constructed standalone and
// the concrete implementations are cross-registered during assembly.
// =============================================================================

/// Fill delivery seam. The book engine pushes venue-driven transitions
/// through this; the order manager implements it.
pub trait FillSink: Send + Sync {
    /// A fill (matched or inferred) against one of our orders.
    fn on_fill(&self, order_id: OrderId, qty: Qty, price: Price, ts: Nanos, is_final: bool);

    /// Venue acknowledged a submitted order.
    fn on_ack(&self, order_id: OrderId, ts: Nanos);

    /// Venue confirmed a cancellation.
    fn on_cancel_confirmed(&self, order_id: OrderId);
}

/// Order submission seam. The order manager routes intents through this;
/// the book engine implements it.
pub trait QuoteVenue: Send + Sync {
    /// Submit one of our orders, marking it ours for queue tracking.
    fn submit(&self, order: &Order) -> (MatchResult, Vec<TradeExecution>);

    /// Modify a resting order in place.
    fn modify(&self, order_id: OrderId, new_price: Price, new_qty: Qty) -> bool;

    /// Cancel a resting order.
    fn cancel(&self, order_id: OrderId) -> bool;

    /// Mark an order cancelled without taking the book lock chain. Used by
    /// the emergency-shutdown path, which must not re-enter the engine.
    fn cancel_hint(&self, order_id: OrderId);

    /// Current top of book (lock-free read).
    fn top_of_book(&self) -> TopOfBook;
}

/// Shared handle aliases used at the seams.
pub type SharedFillSink = Arc<dyn FillSink>;
pub type SharedQuoteVenue = Arc<dyn QuoteVenue>;
