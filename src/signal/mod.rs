//! Signal Engine
//!
//! Two-sided market-making quote generation. Every book update produces a
//! minimal set of place/cancel signals: spread targeting within configured
//! bounds, inventory skew to mean-revert position, refresh and cooldown
//! pacing, and depth-based refinement when the visible book moves enough to
//! matter. Signals are intents; the assembly layer routes them through the
//! order manager.

pub mod config;
pub mod depth;


use crate::book::OrderBookEngine;
use crate::clock::{Nanos, NANOS_PER_MILLI, NANOS_PER_SEC};
use crate::latency::{LatencyKind, LatencyTracker, ScopedTimer};
use crate::oms::OrderManager;
use crate::types::{OrderId, Position, Price, Qty, Side, TopOfBook, TICK_SIZE};
use config::MarketMakingConfig;
use depth::DepthAnalyzer;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

const QTY_EPSILON: f64 = 1e-9;

/// Levels consulted for depth refinement.
const DEPTH_LEVELS: usize = 10;

/// Relative size gap that forces a re-quote.
const SIZE_TOLERANCE: f64 = 0.2;

/// Quotes older than this many refresh intervals are swept as stale.
const STALE_QUOTE_FACTOR: i64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QuoteSide {
    Bid,
    Ask,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QuoteState {
    Inactive,
    Pending,
    Active,
    Cancelling,
    Replacing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignalType {
    PlaceBid,
    PlaceAsk,
    CancelBid,
    CancelAsk,
    ModifyBid,
    ModifyAsk,
    Hold,
    EmergencyCancel,
}

/// One of our active intents on one side of the market.
#[derive(Debug, Clone, Serialize)]
pub struct MarketMakingQuote {
    pub side: QuoteSide,
    pub price: Price,
    pub quantity: Qty,
    pub state: QuoteState,
    pub order_id: OrderId,
    pub creation_time: Nanos,
    pub last_update_time: Nanos,
    /// Spread at issue, basis points.
    pub spread_bps: f64,
    pub is_aggressive: bool,
    pub filled_quantity: Qty,
}

/// An intent emitted toward the order manager.
#[derive(Debug, Clone, Serialize)]
pub struct TradingSignal {
    pub signal_type: SignalType,
    pub side: Side,
    pub price: Price,
    pub quantity: Qty,
    /// Target order for cancels and modifies.
    pub order_id: OrderId,
    pub timestamp: Nanos,
    pub reason: &'static str,
}

/// Quote targets computed for one tick.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QuotePlan {
    pub mid: Price,
    pub half_spread: Price,
    pub skew: Price,
    pub bid_price: Price,
    pub ask_price: Price,
    pub bid_size: Qty,
    pub ask_size: Qty,
    pub aggressive: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MarketMakingStats {
    pub total_quotes_placed: u64,
    pub total_quotes_filled: u64,
    pub total_quotes_cancelled: u64,
    pub fill_rate: f64,
    pub avg_spread_captured_bps: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub risk_violations: u32,
    pub current_position: Position,
    pub position_limit_utilization: f64,
}

pub type SignalCallback = Arc<dyn Fn(&TradingSignal) + Send + Sync>;
pub type QuoteUpdateCallback = Arc<dyn Fn(&MarketMakingQuote) + Send + Sync>;
pub type RiskAlertCallback = Arc<dyn Fn(&str, f64) + Send + Sync>;

#[derive(Default)]
struct SignalCallbacks {
    signal: Option<SignalCallback>,
    quote_update: Option<QuoteUpdateCallback>,
    risk_alert: Option<RiskAlertCallback>,
}

/// Active quotes plus per-side pacing state.
#[derive(Default)]
struct QuoteBoard {
    quotes: HashMap<OrderId, MarketMakingQuote>,
    bid_order: Option<OrderId>,
    ask_order: Option<OrderId>,
    last_bid_action: Nanos,
    last_ask_action: Nanos,
}

struct StatsInner {
    stats: MarketMakingStats,
    spread_captured_samples: u64,
}

/// Compute the quote targets for the current top of book and inventory.
/// Returns `None` when either side is empty or the market is crossed.
pub fn optimal_quotes(
    config: &MarketMakingConfig,
    top: &TopOfBook,
    position: Position,
) -> Option<QuotePlan> {
    if top.bid_price <= 0.0 || top.ask_price <= 0.0 || top.bid_price >= top.ask_price {
        return None;
    }

    let mid = (top.bid_price + top.ask_price) / 2.0;
    let spread_px = config
        .target_spread_bps
        .clamp(config.min_spread_bps, config.max_spread_bps)
        * mid
        / 10_000.0;
    let half_spread = spread_px / 2.0;

    // Long inventory biases both quotes down: easier to sell, harder to buy.
    let inventory_ratio = position / config.max_position;
    let skew_cap = config.max_inventory_skew_bps * mid / 10_000.0;
    let skew = (config.inventory_skew_factor * inventory_ratio * spread_px)
        .clamp(-skew_cap, skew_cap);

    let mut bid_price = mid - half_spread - skew;
    let mut ask_price = mid + half_spread - skew;

    let inside_room = bid_price < top.ask_price - TICK_SIZE && ask_price > top.bid_price + TICK_SIZE;
    let aggressive = config.enable_aggressive_quotes && inside_room;
    if !aggressive {
        bid_price = top.bid_price;
        ask_price = top.ask_price;
    }

    let bid_size = config.default_quote_size * (1.0 - inventory_ratio.clamp(0.0, 1.0));
    let ask_size = config.default_quote_size * (1.0 + inventory_ratio.clamp(-1.0, 0.0));

    Some(QuotePlan {
        mid,
        half_spread,
        skew,
        bid_price,
        ask_price,
        bid_size,
        ask_size,
        aggressive,
    })
}

pub struct SignalEngine {
    latency: Arc<LatencyTracker>,
    config: Mutex<MarketMakingConfig>,

    book: RwLock<Option<Arc<OrderBookEngine>>>,
    oms: RwLock<Option<Arc<OrderManager>>>,

    running: AtomicBool,
    destroying: AtomicBool,

    board: Mutex<QuoteBoard>,
    stats: Mutex<StatsInner>,
    depth: Mutex<DepthAnalyzer>,
    /// Signal timestamps inside the sliding one-second window.
    rate_window: Mutex<VecDeque<Nanos>>,

    callbacks: RwLock<SignalCallbacks>,
}

impl SignalEngine {
    pub fn new(latency: Arc<LatencyTracker>, config: MarketMakingConfig) -> Self {
        Self {
            latency,
            config: Mutex::new(config),
            book: RwLock::new(None),
            oms: RwLock::new(None),
            running: AtomicBool::new(false),
            destroying: AtomicBool::new(false),
            board: Mutex::new(QuoteBoard::default()),
            stats: Mutex::new(StatsInner {
                stats: MarketMakingStats::default(),
                spread_captured_samples: 0,
            }),
            depth: Mutex::new(DepthAnalyzer::new()),
            rate_window: Mutex::new(VecDeque::new()),
            callbacks: RwLock::new(SignalCallbacks::default()),
        }
    }

    pub fn set_orderbook_engine(&self, book: Arc<OrderBookEngine>) {
        *self.book.write() = Some(book);
    }

    pub fn set_order_manager(&self, oms: Arc<OrderManager>) {
        *self.oms.write() = Some(oms);
    }

    pub fn set_signal_callback(&self, cb: SignalCallback) {
        self.callbacks.write().signal = Some(cb);
    }

    pub fn set_quote_update_callback(&self, cb: QuoteUpdateCallback) {
        self.callbacks.write().quote_update = Some(cb);
    }

    pub fn set_risk_alert_callback(&self, cb: RiskAlertCallback) {
        self.callbacks.write().risk_alert = Some(cb);
    }

    pub fn clear_all_callbacks(&self) {
        *self.callbacks.write() = SignalCallbacks::default();
    }

    pub fn start(&self) -> bool {
        if self.destroying.load(Ordering::Acquire) {
            return false;
        }
        self.running.store(true, Ordering::Release);
        debug!("signal engine started");
        true
    }

    /// Stop signal generation. No callback fires after this returns.
    pub fn stop(&self) {
        self.destroying.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);
        self.clear_all_callbacks();
        debug!("signal engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn update_config(&self, config: MarketMakingConfig) {
        *self.config.lock() = config;
    }

    pub fn config(&self) -> MarketMakingConfig {
        self.config.lock().clone()
    }

    #[inline]
    fn now(&self) -> Nanos {
        self.latency.clock().now()
    }

    // =========================================================================
    // PER-TICK SIGNAL GENERATION
    // =========================================================================

    /// Process one top-of-book update and emit the signals it implies.
    pub fn process_market_data_update(&self, top: &TopOfBook) -> Vec<TradingSignal> {
        let _timer = ScopedTimer::fast(&self.latency, LatencyKind::TickToTrade);

        if !self.running.load(Ordering::Acquire) || self.destroying.load(Ordering::Acquire) {
            return Vec::new();
        }

        let config = self.config.lock().clone();
        let position = {
            let oms = self.oms.read();
            match oms.as_ref() {
                Some(oms) => {
                    let info = oms.get_position();
                    info.net_position
                }
                None => 0.0,
            }
        };

        let Some(mut plan) = optimal_quotes(&config, top, position) else {
            trace!("no quote plan: one-sided or crossed market");
            return Vec::new();
        };

        // Mark-to-market on every tick.
        if let Some(oms) = self.oms.read().as_ref() {
            oms.mark_position(plan.mid);
        }

        self.refine_with_depth(&config, &mut plan);

        let now = self.now();
        let mut signals = Vec::new();
        {
            let mut board = self.board.lock();
            let QuoteBoard {
                quotes,
                bid_order,
                ask_order,
                last_bid_action,
                last_ask_action,
            } = &mut *board;
            Self::plan_side(
                quotes,
                bid_order,
                last_bid_action,
                true,
                plan.bid_price,
                plan.bid_size,
                plan.aggressive,
                now,
                &config,
                &mut signals,
            );
            Self::plan_side(
                quotes,
                ask_order,
                last_ask_action,
                false,
                plan.ask_price,
                plan.ask_size,
                plan.aggressive,
                now,
                &config,
                &mut signals,
            );
        }

        let signals = self.apply_rate_limit(signals, &config, now);
        self.emit(&signals);
        signals
    }

    /// Cancel every live quote regardless of cooldown. Fired on risk alerts.
    pub fn emergency_cancel_all(&self, reason: &str, value: f64) -> Vec<TradingSignal> {
        if self.destroying.load(Ordering::Acquire) {
            return Vec::new();
        }
        warn!(reason, value, "emergency cancel of all quotes");

        let now = self.now();
        let mut signals = Vec::new();
        {
            let mut board = self.board.lock();
            for quote in board.quotes.values_mut() {
                quote.state = QuoteState::Cancelling;
                quote.last_update_time = now;
                signals.push(TradingSignal {
                    signal_type: SignalType::EmergencyCancel,
                    side: match quote.side {
                        QuoteSide::Ask => Side::Sell,
                        _ => Side::Buy,
                    },
                    price: quote.price,
                    quantity: quote.quantity,
                    order_id: quote.order_id,
                    timestamp: now,
                    reason: "risk alert",
                });
            }
        }

        {
            let mut stats = self.stats.lock();
            stats.stats.risk_violations += 1;
        }

        let cb = self.callbacks.read().risk_alert.clone();
        if let Some(cb) = cb {
            cb(reason, value);
        }
        self.emit(&signals);
        signals
    }

    // =========================================================================
    // QUOTE TRACKING (driven by the assembly layer)
    // =========================================================================

    pub fn track_order_placement(
        &self,
        order_id: OrderId,
        side: QuoteSide,
        price: Price,
        quantity: Qty,
    ) {
        let now = self.now();
        let spread_bps = {
            let book = self.book.read();
            book.as_ref().map(|b| b.spread_bps()).unwrap_or(0.0)
        };

        let quote = MarketMakingQuote {
            side,
            price,
            quantity,
            state: QuoteState::Active,
            order_id,
            creation_time: now,
            last_update_time: now,
            spread_bps,
            is_aggressive: false,
            filled_quantity: 0.0,
        };

        {
            let mut board = self.board.lock();
            match side {
                QuoteSide::Bid => board.bid_order = Some(order_id),
                QuoteSide::Ask => board.ask_order = Some(order_id),
                QuoteSide::Both => {}
            }
            board.quotes.insert(order_id, quote.clone());
        }
        self.stats.lock().stats.total_quotes_placed += 1;
        self.notify_quote(&quote);
    }

    pub fn track_order_cancellation(&self, order_id: OrderId) {
        let removed = {
            let mut board = self.board.lock();
            let removed = board.quotes.remove(&order_id);
            if board.bid_order == Some(order_id) {
                board.bid_order = None;
            }
            if board.ask_order == Some(order_id) {
                board.ask_order = None;
            }
            removed
        };

        if let Some(mut quote) = removed {
            quote.state = QuoteState::Inactive;
            self.stats.lock().stats.total_quotes_cancelled += 1;
            self.notify_quote(&quote);
        }
    }

    pub fn track_order_fill(&self, order_id: OrderId, fill_qty: Qty, _fill_price: Price) {
        let now = self.now();
        let (snapshot, fully_filled, spread_bps) = {
            let mut board = self.board.lock();
            let Some(quote) = board.quotes.get_mut(&order_id) else {
                return;
            };
            quote.filled_quantity += fill_qty;
            quote.last_update_time = now;
            let done = quote.filled_quantity + QTY_EPSILON >= quote.quantity;
            let spread = quote.spread_bps;
            let snapshot = quote.clone();
            if done {
                board.quotes.remove(&order_id);
                if board.bid_order == Some(order_id) {
                    board.bid_order = None;
                }
                if board.ask_order == Some(order_id) {
                    board.ask_order = None;
                }
            }
            (snapshot, done, spread)
        };

        if fully_filled {
            let mut stats = self.stats.lock();
            stats.stats.total_quotes_filled += 1;
            stats.spread_captured_samples += 1;
            let n = stats.spread_captured_samples as f64;
            stats.stats.avg_spread_captured_bps +=
                (spread_bps / 2.0 - stats.stats.avg_spread_captured_bps) / n;
        }
        self.notify_quote(&snapshot);
    }

    /// Drop quotes that have outlived several refresh intervals without a
    /// terminal event. Returns how many were swept.
    pub fn clear_stale_quotes(&self) -> usize {
        let now = self.now();
        let refresh_ns = self.config.lock().quote_refresh_ms as i64 * NANOS_PER_MILLI;
        let cutoff = now - STALE_QUOTE_FACTOR * refresh_ns;

        let mut board = self.board.lock();
        let stale: Vec<OrderId> = board
            .quotes
            .iter()
            .filter(|(_, q)| q.last_update_time < cutoff)
            .map(|(&id, _)| id)
            .collect();
        for id in &stale {
            board.quotes.remove(id);
            if board.bid_order == Some(*id) {
                board.bid_order = None;
            }
            if board.ask_order == Some(*id) {
                board.ask_order = None;
            }
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "cleared stale quotes");
        }
        stale.len()
    }

    pub fn get_active_quotes(&self) -> Vec<MarketMakingQuote> {
        self.board.lock().quotes.values().cloned().collect()
    }

    pub fn get_statistics(&self) -> MarketMakingStats {
        let mut stats = {
            let mut inner = self.stats.lock();
            if inner.stats.total_quotes_placed > 0 {
                inner.stats.fill_rate =
                    inner.stats.total_quotes_filled as f64 / inner.stats.total_quotes_placed as f64;
            }
            inner.stats
        };

        if let Some(oms) = self.oms.read().as_ref() {
            let position = oms.get_position();
            stats.current_position = position.net_position;
            stats.realized_pnl = position.realized_pnl;
            stats.unrealized_pnl = position.unrealized_pnl;
            let max_position = self.config.lock().max_position;
            if max_position > 0.0 {
                stats.position_limit_utilization = position.net_position.abs() / max_position;
            }
        }
        stats
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    /// Override the plan with the analyzer's depth-aware quotes when the
    /// visible book has shifted enough to matter.
    fn refine_with_depth(&self, config: &MarketMakingConfig, plan: &mut QuotePlan) {
        let Some(book) = self.book.read().clone() else {
            return;
        };
        let depth = book.market_depth(DEPTH_LEVELS);
        if depth.bids.len() <= 1 && depth.asks.len() <= 1 {
            return;
        }

        let metrics = self.depth.lock().analyze(
            &depth,
            plan,
            book.spread_bps(),
            config.target_spread_bps / 2.0,
        );
        if !metrics.significant_change {
            return;
        }

        plan.bid_price = metrics.optimal_bid_price;
        plan.ask_price = metrics.optimal_ask_price;
        plan.bid_size = metrics.optimal_bid_size;
        plan.ask_size = metrics.optimal_ask_size;
        trace!(
            pressure = metrics.market_pressure,
            "depth refinement applied"
        );
    }

    /// Decide what one side needs: place, cancel-and-replace, or hold.
    #[allow(clippy::too_many_arguments)]
    fn plan_side(
        quotes: &mut HashMap<OrderId, MarketMakingQuote>,
        slot: &mut Option<OrderId>,
        last_action: &mut Nanos,
        is_bid: bool,
        target_price: Price,
        target_size: Qty,
        aggressive: bool,
        now: Nanos,
        config: &MarketMakingConfig,
        signals: &mut Vec<TradingSignal>,
    ) {
        let cooldown = config.cooldown_ms as i64 * NANOS_PER_MILLI;
        let refresh = config.quote_refresh_ms as i64 * NANOS_PER_MILLI;
        let side = if is_bid { Side::Buy } else { Side::Sell };
        let in_cooldown = now - *last_action < cooldown;

        let hold = |signals: &mut Vec<TradingSignal>, reason: &'static str| {
            signals.push(TradingSignal {
                signal_type: SignalType::Hold,
                side,
                price: 0.0,
                quantity: 0.0,
                order_id: 0,
                timestamp: now,
                reason,
            });
        };

        // Inventory-full side: pull the standing quote and stay out.
        if target_size <= QTY_EPSILON {
            if let Some(id) = *slot {
                if in_cooldown {
                    hold(signals, "cooldown");
                } else {
                    let price = quotes.get(&id).map(|q| q.price).unwrap_or(0.0);
                    signals.push(TradingSignal {
                        signal_type: if is_bid {
                            SignalType::CancelBid
                        } else {
                            SignalType::CancelAsk
                        },
                        side,
                        price,
                        quantity: 0.0,
                        order_id: id,
                        timestamp: now,
                        reason: "inventory limit",
                    });
                    *last_action = now;
                }
            }
            return;
        }

        match *slot {
            None => {
                if in_cooldown {
                    hold(signals, "cooldown");
                    return;
                }
                signals.push(TradingSignal {
                    signal_type: if is_bid {
                        SignalType::PlaceBid
                    } else {
                        SignalType::PlaceAsk
                    },
                    side,
                    price: target_price,
                    quantity: target_size,
                    order_id: 0,
                    timestamp: now,
                    reason: if aggressive { "quote inside spread" } else { "join best" },
                });
                *last_action = now;
            }
            Some(id) => {
                let Some(quote) = quotes.get_mut(&id) else {
                    *slot = None;
                    return;
                };

                let off_price = (quote.price - target_price).abs() > TICK_SIZE;
                let expired = now - quote.creation_time >= refresh;
                let size_gap =
                    (quote.quantity - target_size).abs() > SIZE_TOLERANCE * target_size;
                if !(off_price || expired || size_gap) {
                    return;
                }
                if in_cooldown {
                    hold(signals, "cooldown");
                    return;
                }

                quote.state = QuoteState::Replacing;
                signals.push(TradingSignal {
                    signal_type: if is_bid {
                        SignalType::CancelBid
                    } else {
                        SignalType::CancelAsk
                    },
                    side,
                    price: quote.price,
                    quantity: quote.quantity,
                    order_id: id,
                    timestamp: now,
                    reason: if expired { "quote refresh" } else { "off target" },
                });
                signals.push(TradingSignal {
                    signal_type: if is_bid {
                        SignalType::PlaceBid
                    } else {
                        SignalType::PlaceAsk
                    },
                    side,
                    price: target_price,
                    quantity: target_size,
                    order_id: 0,
                    timestamp: now,
                    reason: "replace",
                });
                *last_action = now;
            }
        }
    }

    /// Enforce the per-second signal budget: cancels survive first, then
    /// places; holds pass through untouched.
    fn apply_rate_limit(
        &self,
        signals: Vec<TradingSignal>,
        config: &MarketMakingConfig,
        now: Nanos,
    ) -> Vec<TradingSignal> {
        let actionable = signals
            .iter()
            .filter(|s| s.signal_type != SignalType::Hold)
            .count();
        if actionable == 0 {
            return signals;
        }

        let mut window = self.rate_window.lock();
        let cutoff = now - NANOS_PER_SEC;
        while window.front().is_some_and(|&t| t < cutoff) {
            window.pop_front();
        }
        let budget = (config.max_orders_per_second as usize).saturating_sub(window.len());

        if actionable <= budget {
            for _ in 0..actionable {
                window.push_back(now);
            }
            return signals;
        }

        // Over budget: keep cancels ahead of places, drop the rest.
        let mut kept = Vec::with_capacity(budget + signals.len() - actionable);
        let mut remaining = budget;
        for priority_cancel in [true, false] {
            for signal in &signals {
                let is_cancel = matches!(
                    signal.signal_type,
                    SignalType::CancelBid | SignalType::CancelAsk | SignalType::EmergencyCancel
                );
                let is_hold = signal.signal_type == SignalType::Hold;
                if is_hold {
                    continue;
                }
                if is_cancel == priority_cancel && remaining > 0 {
                    kept.push(signal.clone());
                    window.push_back(now);
                    remaining -= 1;
                }
            }
        }
        warn!(
            dropped = actionable - kept.len(),
            "rate limit dropped lower-priority signals"
        );
        kept
    }

    fn emit(&self, signals: &[TradingSignal]) {
        if signals.is_empty() || self.destroying.load(Ordering::Acquire) {
            return;
        }
        let cb = self.callbacks.read().signal.clone();
        if let Some(cb) = cb {
            for signal in signals {
                cb(signal);
            }
        }
    }

    fn notify_quote(&self, quote: &MarketMakingQuote) {
        if self.destroying.load(Ordering::Acquire) {
            return;
        }
        let cb = self.callbacks.read().quote_update.clone();
        if let Some(cb) = cb {
            cb(quote);
        }
    }
}
