//! Book Engine
//!
//! Price-time-priority order book for one symbol. Maintains the external
//! level-2 replica from feed snapshots and deltas, matches aggressive orders
//! against it, and infers fills for our own resting quotes by correlating
//! exchange prints with modelled queue positions.
//!
//! Mutations are serialized by one book mutex; best bid/ask and the last
//! trade price are mirrored into lock-free cells so any thread can read the
//! top of book without contention. Callbacks fire on the calling thread
//! after the mutating operation has released the book lock.

mod levels;
pub mod queue_model;

#[cfg(test)]
mod book_tests;

use crate::clock::Nanos;
use crate::latency::{LatencyKind, LatencyTracker, ScopedTimer};
use crate::types::{
    is_valid_price, is_valid_quantity, spread_bps, BookSide, DepthKind, Level, MarketDepth,
    MatchResult, Order, OrderBookStats, OrderId, OrderStatus, Price, Qty, QuoteVenue,
    SharedFillSink, Side, TopOfBook, TradeExecution,
};
use crossbeam::atomic::AtomicCell;
use levels::{prices_equal, Ladder, PRICE_EPSILON, QTY_EPSILON};
use parking_lot::{Mutex, RwLock};
use queue_model::{QueuePosition, QueueTracker};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub type BookUpdateCallback = Arc<dyn Fn(&TopOfBook) + Send + Sync>;
pub type TradeCallback = Arc<dyn Fn(&TradeExecution) + Send + Sync>;
pub type DepthUpdateCallback = Arc<dyn Fn(&MarketDepth) + Send + Sync>;

/// A level is compacted once this many lazily-cancelled entries accumulate
/// in its FIFO.
const LEVEL_COMPACT_THRESHOLD: usize = 64;

#[derive(Default)]
struct Callbacks {
    book_update: Option<BookUpdateCallback>,
    trade: Option<TradeCallback>,
    depth: Option<DepthUpdateCallback>,
}

struct StatsInner {
    stats: OrderBookStats,
    spread_samples: u64,
}

struct BookInner {
    bids: Ladder,
    asks: Ladder,
    /// Orders added through `add_order`, keyed by id. Entries persist until
    /// consumed, purged by lazy-cancel cleanup, or the level is compacted.
    active_orders: HashMap<OrderId, Order>,
    /// Lazily-cancelled ids awaiting removal from their FIFO.
    cancelled: HashSet<OrderId>,
}

/// A fill destined for the order manager, captured while the book lock is
/// held and delivered after it is released.
struct SinkEvent {
    order_id: OrderId,
    qty: Qty,
    price: Price,
    timestamp: Nanos,
    is_final: bool,
}

pub struct OrderBookEngine {
    symbol: String,
    latency: Arc<LatencyTracker>,

    inner: Mutex<BookInner>,
    queue: Mutex<QueueTracker>,
    our_orders: RwLock<HashSet<OrderId>>,
    stats: Mutex<StatsInner>,

    next_trade_id: AtomicU64,

    // Lock-free top-of-book mirror.
    best_bid: AtomicCell<f64>,
    best_bid_qty: AtomicCell<f64>,
    best_ask: AtomicCell<f64>,
    best_ask_qty: AtomicCell<f64>,
    last_trade_price: AtomicCell<f64>,

    callbacks: RwLock<Callbacks>,
    fill_sink: RwLock<Option<SharedFillSink>>,
}

impl OrderBookEngine {
    pub fn new(symbol: &str, latency: Arc<LatencyTracker>) -> Self {
        Self {
            symbol: symbol.to_string(),
            latency,
            inner: Mutex::new(BookInner {
                bids: Ladder::new(BookSide::Bid),
                asks: Ladder::new(BookSide::Ask),
                active_orders: HashMap::new(),
                cancelled: HashSet::new(),
            }),
            queue: Mutex::new(QueueTracker::new()),
            our_orders: RwLock::new(HashSet::new()),
            stats: Mutex::new(StatsInner {
                stats: OrderBookStats::default(),
                spread_samples: 0,
            }),
            next_trade_id: AtomicU64::new(1),
            best_bid: AtomicCell::new(0.0),
            best_bid_qty: AtomicCell::new(0.0),
            best_ask: AtomicCell::new(0.0),
            best_ask_qty: AtomicCell::new(0.0),
            last_trade_price: AtomicCell::new(0.0),
            callbacks: RwLock::new(Callbacks::default()),
            fill_sink: RwLock::new(None),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Second wiring phase: the order manager registers itself here to
    /// receive fills and cancel confirmations.
    pub fn set_fill_sink(&self, sink: SharedFillSink) {
        *self.fill_sink.write() = Some(sink);
    }

    pub fn set_book_update_callback(&self, cb: BookUpdateCallback) {
        self.callbacks.write().book_update = Some(cb);
    }

    pub fn set_trade_callback(&self, cb: TradeCallback) {
        self.callbacks.write().trade = Some(cb);
    }

    pub fn set_depth_update_callback(&self, cb: DepthUpdateCallback) {
        self.callbacks.write().depth = Some(cb);
    }

    pub fn clear_callbacks(&self) {
        *self.callbacks.write() = Callbacks::default();
    }

    #[inline]
    fn now(&self) -> Nanos {
        self.latency.clock().now()
    }

    #[inline]
    fn alloc_trade_id(&self) -> u64 {
        self.next_trade_id.fetch_add(1, Ordering::Relaxed)
    }

    // =========================================================================
    // CORE BOOK OPERATIONS (CRITICAL PATH)
    // =========================================================================

    /// Add a limit order to the book: match what crosses, rest the rest.
    pub fn add_order(&self, order: &Order) -> (MatchResult, Vec<TradeExecution>) {
        let _timer = ScopedTimer::fast(&self.latency, LatencyKind::OrderBookUpdate);

        if !self.validate_order(order) {
            return (MatchResult::Rejected, Vec::new());
        }

        let (result, executions, _queue_ahead, sink_events) = self.add_order_locked(order);
        self.dispatch(&executions, sink_events);
        (result, executions)
    }

    /// Modify a resting order. A price change or quantity increase loses time
    /// priority and is treated as cancel + re-add (matching if it now
    /// crosses); a pure quantity decrease keeps the order's place.
    pub fn modify_order(&self, order_id: OrderId, new_price: Price, new_qty: Qty) -> bool {
        if !is_valid_price(new_price) || !is_valid_quantity(new_qty) {
            warn!(order_id, new_price, new_qty, "modify rejected: invalid params");
            return false;
        }

        let now = self.now();
        let mut inner = self.inner.lock();

        let Some(current) = inner.active_orders.get(&order_id).cloned() else {
            return false;
        };
        if inner.cancelled.contains(&order_id) {
            return false;
        }

        if prices_equal(current.price, new_price) && new_qty < current.remaining_quantity {
            // Quantity decrease in place.
            let delta = current.remaining_quantity - new_qty;
            let side = BookSide::from(current.side);
            let ladder = match side {
                BookSide::Bid => &mut inner.bids,
                BookSide::Ask => &mut inner.asks,
            };
            if let Some(level) = ladder.level_mut(current.price) {
                level.reduce(delta, now);
            }
            if let Some(resting) = inner.active_orders.get_mut(&order_id) {
                resting.remaining_quantity = new_qty;
                resting.last_update_time = now;
            }
            self.queue.lock().reduce_quantity(order_id, new_qty);
            self.refresh_best(&inner);
            drop(inner);
            self.notify_book_update();
            trace!(order_id, new_qty, "order quantity reduced in place");
            return true;
        }

        if prices_equal(current.price, new_price)
            && (new_qty - current.remaining_quantity).abs() <= QTY_EPSILON
        {
            // Identical parameters: observable no-op.
            return true;
        }

        // Reposition: physically remove, then run the add path again.
        Self::remove_resting(&mut inner, &current, now);
        let mut replacement = current.clone();
        replacement.price = new_price;
        replacement.original_quantity = new_qty;
        replacement.remaining_quantity = new_qty;
        replacement.last_update_time = now;

        let (executions, queue_ahead, rested, sink_events) =
            Self::match_and_rest(&mut inner, &self.next_trade_id, &self.our_orders, &mut replacement, now);
        self.refresh_best(&inner);
        drop(inner);

        let mut queue = self.queue.lock();
        queue.remove(order_id);
        if rested {
            queue.track(
                order_id,
                replacement.side,
                new_price,
                replacement.remaining_quantity,
                queue_ahead,
                now,
            );
        }
        drop(queue);

        self.record_trades(&executions);
        self.dispatch(&executions, sink_events);
        debug!(order_id, new_price, new_qty, "order repositioned");
        true
    }

    /// Cancel a resting order: O(1) mark for lazy FIFO skip; the level total
    /// is reduced immediately.
    pub fn cancel_order(&self, order_id: OrderId) -> bool {
        let _timer = ScopedTimer::fast(&self.latency, LatencyKind::OrderCancellation);

        let now = self.now();
        let mut inner = self.inner.lock();
        if !self.cancel_locked(&mut inner, order_id, now) {
            return false;
        }
        self.refresh_best(&inner);
        drop(inner);

        self.queue.lock().remove(order_id);
        self.our_orders.write().remove(&order_id);
        self.notify_book_update();
        true
    }

    /// Sweep best opposite prices until filled or the book is exhausted.
    /// Market orders never rest.
    pub fn process_market_order(
        &self,
        side: Side,
        quantity: Qty,
    ) -> (MatchResult, Vec<TradeExecution>) {
        let _timer = ScopedTimer::fast(&self.latency, LatencyKind::OrderBookUpdate);

        if !is_valid_quantity(quantity) {
            self.stats.lock().stats.rejected_orders += 1;
            return (MatchResult::Rejected, Vec::new());
        }

        let now = self.now();
        let mut order = Order::new(0, side, 0.0, quantity, now);
        let mut executions = Vec::new();
        let mut inner = self.inner.lock();
        let sink_events = Self::match_incoming(
            &mut inner,
            &self.next_trade_id,
            &self.our_orders,
            &mut order,
            None,
            now,
            &mut executions,
        );
        self.refresh_best(&inner);
        drop(inner);

        let result = if executions.is_empty() {
            MatchResult::NoMatch
        } else if order.remaining_quantity > QTY_EPSILON {
            MatchResult::PartialFill
        } else {
            MatchResult::FullFill
        };

        self.bump_order_stats();
        self.record_trades(&executions);
        self.dispatch(&executions, sink_events);
        (result, executions)
    }

    // =========================================================================
    // EXTERNAL MARKET DATA
    // =========================================================================

    /// Apply an external depth record: snapshots replace the covered sides,
    /// updates set per-level quantities (zero removes the level). Malformed
    /// levels are dropped and counted; the record never aborts processing.
    pub fn apply_market_data_update(&self, depth: &MarketDepth) {
        let _timer = ScopedTimer::fast(&self.latency, LatencyKind::OrderBookUpdate);

        let now = self.now();
        let mut dropped = 0u64;
        let mut inner = self.inner.lock();

        match depth.kind {
            DepthKind::Snapshot => {
                dropped += Self::apply_snapshot_side(&mut inner, BookSide::Bid, &depth.bids, now);
                dropped += Self::apply_snapshot_side(&mut inner, BookSide::Ask, &depth.asks, now);
            }
            DepthKind::Update => {
                dropped += Self::apply_update_side(&mut inner, BookSide::Bid, &depth.bids, now);
                dropped += Self::apply_update_side(&mut inner, BookSide::Ask, &depth.asks, now);
            }
        }

        self.refresh_best(&inner);
        drop(inner);

        {
            let mut stats = self.stats.lock();
            stats.stats.total_updates += 1;
            stats.stats.dropped_updates += dropped;
        }
        if dropped > 0 {
            warn!(dropped, "dropped malformed depth levels");
        }

        let callbacks = self.callbacks.read();
        if let Some(cb) = callbacks.depth.clone() {
            drop(callbacks);
            cb(depth);
        }
        self.notify_book_update();
    }

    /// Process an external print: decay queue positions for our resting
    /// orders on the passive side of the print and emit any inferred fills.
    pub fn process_market_data_trade(&self, trade: &TradeExecution) {
        let _timer = ScopedTimer::fast(&self.latency, LatencyKind::MarketDataProcessing);

        if !is_valid_price(trade.price) || !is_valid_quantity(trade.quantity) {
            self.stats.lock().stats.dropped_updates += 1;
            return;
        }

        let now = self.now();
        self.last_trade_price.store(trade.price);
        {
            let mut stats = self.stats.lock();
            stats.stats.last_trade_time = trade.timestamp;
        }

        let inferred = self
            .queue
            .lock()
            .on_external_print(trade.aggressor_side, trade.price, trade.quantity);

        // Keep the replica roughly consistent between depth updates: the
        // print consumed passive liquidity at that level.
        let mut inner = self.inner.lock();
        {
            let ladder = match trade.aggressor_side {
                Side::Buy => &mut inner.asks,
                Side::Sell => &mut inner.bids,
            };
            let mut purge = false;
            if let Some(level) = ladder.level_mut(trade.price) {
                let consumed = trade.quantity.min(level.external_qty);
                level.external_qty -= consumed;
                level.reduce(consumed, now);
                purge = level.is_empty() && level.queue.is_empty();
            }
            if purge {
                ladder.remove(trade.price);
            }
        }

        let mut executions = Vec::with_capacity(inferred.len());
        let mut sink_events = Vec::with_capacity(inferred.len());
        for fill in &inferred {
            Self::apply_inferred_fill(&mut inner, fill, now);
            executions.push(TradeExecution {
                trade_id: self.alloc_trade_id(),
                aggressor_order_id: 0,
                passive_order_id: fill.order_id,
                price: fill.price,
                quantity: fill.quantity,
                aggressor_side: trade.aggressor_side,
                timestamp: now,
            });
            sink_events.push(SinkEvent {
                order_id: fill.order_id,
                qty: fill.quantity,
                price: fill.price,
                timestamp: now,
                is_final: fill.is_final,
            });
            if fill.is_final {
                debug!(order_id = fill.order_id, price = fill.price, "inferred full fill");
            }
        }
        self.refresh_best(&inner);
        drop(inner);

        for fill in &inferred {
            if fill.is_final {
                self.our_orders.write().remove(&fill.order_id);
            }
        }

        self.record_trades(&executions);
        self.dispatch(&executions, sink_events);
    }

    // =========================================================================
    // ORDER MANAGER INTEGRATION
    // =========================================================================

    /// Submission entry point for the order manager: marks the order as ours,
    /// runs the normal add path, and registers a queue position for any
    /// resting remainder using the level total before our insertion.
    pub fn submit_order_from_manager(&self, order: &Order) -> (MatchResult, Vec<TradeExecution>) {
        let _timer = ScopedTimer::fast(&self.latency, LatencyKind::OrderPlacement);

        if !self.validate_order(order) {
            return (MatchResult::Rejected, Vec::new());
        }

        self.our_orders.write().insert(order.order_id);

        let now = self.now();
        let (result, executions, queue_ahead, sink_events) = self.add_order_locked(order);

        if result != MatchResult::Rejected && result != MatchResult::FullFill {
            let filled: Qty = executions.iter().map(|e| e.quantity).sum();
            let remaining = order.remaining_quantity - filled;
            if remaining > QTY_EPSILON {
                self.queue.lock().track(
                    order.order_id,
                    order.side,
                    order.price,
                    remaining,
                    queue_ahead,
                    now,
                );
            }
        }

        self.dispatch(&executions, sink_events);
        (result, executions)
    }

    /// Start tracking a queue position with `queue_ahead` taken from the
    /// current visible level total.
    pub fn track_queue_position(&self, order_id: OrderId, side: Side, price: Price, quantity: Qty) {
        let ahead = {
            let inner = self.inner.lock();
            let ladder = match BookSide::from(side) {
                BookSide::Bid => &inner.bids,
                BookSide::Ask => &inner.asks,
            };
            ladder.level(price).map(|l| l.total_qty).unwrap_or(0.0)
        };
        self.track_queue_position_exact(order_id, side, price, quantity, ahead);
    }

    /// Start tracking a queue position with a feed-provided queue-ahead.
    pub fn track_queue_position_exact(
        &self,
        order_id: OrderId,
        side: Side,
        price: Price,
        quantity: Qty,
        queue_ahead: Qty,
    ) {
        let now = self.now();
        self.queue
            .lock()
            .track(order_id, side, price, quantity, queue_ahead, now);
    }

    /// Current modelled queue position for one of our orders.
    pub fn queue_position(&self, order_id: OrderId) -> Option<QueuePosition> {
        self.queue.lock().get(order_id).cloned()
    }

    // =========================================================================
    // READ-ONLY ACCESSORS
    // =========================================================================

    /// Lock-free top of book from the cached cells.
    pub fn top_of_book(&self) -> TopOfBook {
        let bid = self.best_bid.load();
        let bid_qty = self.best_bid_qty.load();
        let ask = self.best_ask.load();
        let ask_qty = self.best_ask_qty.load();

        let (mid, spread) = if bid > 0.0 && ask > 0.0 {
            ((bid + ask) / 2.0, ask - bid)
        } else {
            (0.0, 0.0)
        };

        TopOfBook {
            bid_price: bid,
            bid_quantity: bid_qty,
            ask_price: ask,
            ask_quantity: ask_qty,
            mid_price: mid,
            spread,
            timestamp: self.now(),
        }
    }

    pub fn mid_price(&self) -> Price {
        let bid = self.best_bid.load();
        let ask = self.best_ask.load();
        if bid > 0.0 && ask > 0.0 {
            (bid + ask) / 2.0
        } else {
            0.0
        }
    }

    pub fn spread_bps(&self) -> f64 {
        let bid = self.best_bid.load();
        let ask = self.best_ask.load();
        if bid > 0.0 && ask > 0.0 {
            spread_bps(bid, ask)
        } else {
            0.0
        }
    }

    pub fn last_trade_price(&self) -> Option<Price> {
        let px = self.last_trade_price.load();
        if px > 0.0 {
            Some(px)
        } else {
            None
        }
    }

    /// Crossed market is tolerated on read; it can only come from a stale
    /// external feed and heals on the next consistent update.
    pub fn is_market_crossed(&self) -> bool {
        let bid = self.best_bid.load();
        let ask = self.best_ask.load();
        bid > 0.0 && ask > 0.0 && bid >= ask - PRICE_EPSILON
    }

    /// Aggregated level-2 view of the top `levels` on each side.
    pub fn market_depth(&self, levels: usize) -> MarketDepth {
        let inner = self.inner.lock();
        let collect = |ladder: &Ladder| -> Vec<Level> {
            ladder
                .iter()
                .filter(|l| !l.is_empty())
                .take(levels)
                .map(|l| Level::new(l.price, l.total_qty))
                .collect()
        };
        MarketDepth {
            kind: DepthKind::Snapshot,
            bids: collect(&inner.bids),
            asks: collect(&inner.asks),
            timestamp: self.now(),
        }
    }

    pub fn statistics(&self) -> OrderBookStats {
        self.stats.lock().stats
    }

    /// Tracked order by id, if still resting.
    pub fn order(&self, order_id: OrderId) -> Option<Order> {
        let inner = self.inner.lock();
        if inner.cancelled.contains(&order_id) {
            return None;
        }
        inner.active_orders.get(&order_id).cloned()
    }

    /// Reset to an empty book.
    pub fn clear_book(&self) {
        let mut inner = self.inner.lock();
        inner.bids.clear();
        inner.asks.clear();
        inner.active_orders.clear();
        inner.cancelled.clear();
        self.refresh_best(&inner);
        drop(inner);
        self.queue.lock().clear();
        self.our_orders.write().clear();
        self.last_trade_price.store(0.0);
    }

    pub fn reset_performance_counters(&self) {
        let mut stats = self.stats.lock();
        stats.stats = OrderBookStats::default();
        stats.spread_samples = 0;
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn validate_order(&self, order: &Order) -> bool {
        let valid = order.order_id != 0
            && is_valid_price(order.price)
            && is_valid_quantity(order.remaining_quantity);
        if !valid {
            self.stats.lock().stats.rejected_orders += 1;
            warn!(
                order_id = order.order_id,
                price = order.price,
                qty = order.remaining_quantity,
                "order rejected at validation"
            );
            return false;
        }
        let duplicate = self.inner.lock().active_orders.contains_key(&order.order_id);
        if duplicate {
            self.stats.lock().stats.rejected_orders += 1;
            warn!(order_id = order.order_id, "order rejected: duplicate id");
            return false;
        }
        true
    }

    /// Shared add path: match then rest under one lock acquisition.
    fn add_order_locked(
        &self,
        order: &Order,
    ) -> (MatchResult, Vec<TradeExecution>, Qty, Vec<SinkEvent>) {
        let now = self.now();
        let mut work = order.clone();

        let mut inner = self.inner.lock();
        let (executions, queue_ahead, _rested, sink_events) = Self::match_and_rest(
            &mut inner,
            &self.next_trade_id,
            &self.our_orders,
            &mut work,
            now,
        );
        self.refresh_best(&inner);
        drop(inner);

        let result = if executions.is_empty() {
            MatchResult::NoMatch
        } else if work.remaining_quantity > QTY_EPSILON {
            MatchResult::PartialFill
        } else {
            MatchResult::FullFill
        };

        self.bump_order_stats();
        self.record_trades(&executions);
        (result, executions, queue_ahead, sink_events)
    }

    /// Match an incoming limit order and rest any remainder. Returns the
    /// executions, the level total ahead of the rested remainder (before our
    /// insertion), whether it rested, and the captured sink events.
    fn match_and_rest(
        inner: &mut BookInner,
        next_trade_id: &AtomicU64,
        our_orders: &RwLock<HashSet<OrderId>>,
        order: &mut Order,
        now: Nanos,
    ) -> (Vec<TradeExecution>, Qty, bool, Vec<SinkEvent>) {
        let mut executions = Vec::new();
        let mut sink_events = Self::match_incoming(
            inner,
            next_trade_id,
            our_orders,
            order,
            Some(order.price),
            now,
            &mut executions,
        );

        // Aggressor-side fills for our own orders.
        if !executions.is_empty() && our_orders.read().contains(&order.order_id) {
            let fully_filled = order.remaining_quantity <= QTY_EPSILON;
            let last = executions.len() - 1;
            for (i, exec) in executions.iter().enumerate() {
                sink_events.push(SinkEvent {
                    order_id: order.order_id,
                    qty: exec.quantity,
                    price: exec.price,
                    timestamp: exec.timestamp,
                    is_final: fully_filled && i == last,
                });
            }
        }

        let mut queue_ahead = 0.0;
        let mut rested = false;
        if order.remaining_quantity > QTY_EPSILON {
            let ladder = match BookSide::from(order.side) {
                BookSide::Bid => &mut inner.bids,
                BookSide::Ask => &mut inner.asks,
            };
            let level = ladder.get_or_insert(order.price, now);
            queue_ahead = level.total_qty;
            level.add_tracked(order.order_id, order.remaining_quantity, now);
            order.last_update_time = now;
            inner.active_orders.insert(order.order_id, order.clone());
            rested = true;
            trace!(
                order_id = order.order_id,
                price = order.price,
                qty = order.remaining_quantity,
                "order rested"
            );
        }

        (executions, queue_ahead, rested, sink_events)
    }

    /// Walk the opposite side in price order, consuming eligible liquidity.
    /// `limit` of `None` means a market order. Trades print at the passive
    /// price. Returns fill events for tracked orders that belong to us.
    fn match_incoming(
        inner: &mut BookInner,
        next_trade_id: &AtomicU64,
        our_orders: &RwLock<HashSet<OrderId>>,
        order: &mut Order,
        limit: Option<Price>,
        now: Nanos,
        executions: &mut Vec<TradeExecution>,
    ) -> Vec<SinkEvent> {
        let mut sink_events = Vec::new();

        // An equal-to-limit level is eligible only when it was already the
        // best at arrival; deeper equal-priced liquidity is joined, not
        // crossed.
        let initial_best = match order.side {
            Side::Buy => inner.asks.best_price(),
            Side::Sell => inner.bids.best_price(),
        };

        while order.remaining_quantity > QTY_EPSILON {
            let best = match order.side {
                Side::Buy => inner.asks.best_price(),
                Side::Sell => inner.bids.best_price(),
            };
            let Some(level_price) = best else { break };

            if let Some(limit_px) = limit {
                let strictly_better = match order.side {
                    Side::Buy => level_price < limit_px - PRICE_EPSILON,
                    Side::Sell => level_price > limit_px + PRICE_EPSILON,
                };
                let equal_and_was_best = prices_equal(level_price, limit_px)
                    && initial_best.is_some_and(|b| prices_equal(b, level_price));
                if !(strictly_better || equal_and_was_best) {
                    break;
                }
            }

            let made_progress = Self::consume_level(
                inner,
                next_trade_id,
                our_orders,
                order,
                level_price,
                now,
                executions,
                &mut sink_events,
            );
            if !made_progress {
                break;
            }
        }

        sink_events
    }

    /// Consume liquidity at one level: anonymous external quantity first
    /// (it was resting before we saw it), then the tracked FIFO with lazy
    /// cancellation cleanup. Returns false when nothing could be consumed.
    #[allow(clippy::too_many_arguments)]
    fn consume_level(
        inner: &mut BookInner,
        next_trade_id: &AtomicU64,
        our_orders: &RwLock<HashSet<OrderId>>,
        order: &mut Order,
        level_price: Price,
        now: Nanos,
        executions: &mut Vec<TradeExecution>,
        sink_events: &mut Vec<SinkEvent>,
    ) -> bool {
        let BookInner {
            bids,
            asks,
            active_orders,
            cancelled,
        } = inner;
        let ladder = match order.side {
            Side::Buy => asks,
            Side::Sell => bids,
        };
        let Some(level) = ladder.level_mut(level_price) else {
            return false;
        };

        let mut progressed = false;

        if level.external_qty > QTY_EPSILON {
            let qty = level.external_qty.min(order.remaining_quantity);
            level.external_qty -= qty;
            level.reduce(qty, now);
            order.remaining_quantity -= qty;
            executions.push(TradeExecution {
                trade_id: next_trade_id.fetch_add(1, Ordering::Relaxed),
                aggressor_order_id: order.order_id,
                passive_order_id: 0,
                price: level_price,
                quantity: qty,
                aggressor_side: order.side,
                timestamp: now,
            });
            progressed = true;
        }

        while order.remaining_quantity > QTY_EPSILON {
            let Some(&front) = level.queue.front() else { break };

            if cancelled.remove(&front) {
                level.queue.pop_front();
                level.cancelled_count = level.cancelled_count.saturating_sub(1);
                active_orders.remove(&front);
                continue;
            }
            let Some(resting) = active_orders.get_mut(&front) else {
                level.queue.pop_front();
                continue;
            };

            let qty = resting.remaining_quantity.min(order.remaining_quantity);
            resting.remaining_quantity -= qty;
            resting.last_update_time = now;
            order.remaining_quantity -= qty;
            level.reduce(qty, now);
            progressed = true;

            let exec = TradeExecution {
                trade_id: next_trade_id.fetch_add(1, Ordering::Relaxed),
                aggressor_order_id: order.order_id,
                passive_order_id: front,
                price: level.price,
                quantity: qty,
                aggressor_side: order.side,
                timestamp: now,
            };
            executions.push(exec);

            let consumed = resting.remaining_quantity <= QTY_EPSILON;
            if our_orders.read().contains(&front) {
                sink_events.push(SinkEvent {
                    order_id: front,
                    qty,
                    price: exec.price,
                    timestamp: now,
                    is_final: consumed,
                });
            }

            if consumed {
                resting.status = OrderStatus::Filled;
                level.queue.pop_front();
                active_orders.remove(&front);
            }
        }

        if level.is_empty() {
            // Only cancelled or stale ids can remain in the FIFO at zero
            // total; purge them with the level.
            for id in level.queue.iter() {
                cancelled.remove(id);
                active_orders.remove(id);
            }
            ladder.remove(level_price);
        }

        progressed
    }

    fn cancel_locked(&self, inner: &mut BookInner, order_id: OrderId, now: Nanos) -> bool {
        if inner.cancelled.contains(&order_id) {
            return false;
        }
        let Some(order) = inner.active_orders.get(&order_id).cloned() else {
            trace!(order_id, "cancel miss: unknown order");
            return false;
        };

        inner.cancelled.insert(order_id);
        if let Some(resting) = inner.active_orders.get_mut(&order_id) {
            resting.status = OrderStatus::Cancelled;
        }

        let ladder = match BookSide::from(order.side) {
            BookSide::Bid => &mut inner.bids,
            BookSide::Ask => &mut inner.asks,
        };
        let mut purge_level = false;
        let mut compact = false;
        if let Some(level) = ladder.level_mut(order.price) {
            level.reduce(order.remaining_quantity, now);
            level.cancelled_count += 1;
            purge_level = level.is_empty();
            compact = level.cancelled_count >= LEVEL_COMPACT_THRESHOLD;
        }
        if purge_level {
            if let Some(level) = ladder.remove(order.price) {
                for id in level.queue.iter() {
                    inner.cancelled.remove(id);
                    inner.active_orders.remove(id);
                }
            }
        } else if compact {
            Self::compact_level(inner, order.side, order.price);
        }

        trace!(order_id, "order cancelled (lazy)");
        true
    }

    /// Rebuild a level's FIFO without its cancelled entries.
    fn compact_level(inner: &mut BookInner, side: Side, price: Price) {
        let BookInner {
            bids,
            asks,
            active_orders,
            cancelled,
        } = inner;
        let ladder = match BookSide::from(side) {
            BookSide::Bid => bids,
            BookSide::Ask => asks,
        };
        let Some(level) = ladder.level_mut(price) else {
            return;
        };

        let old = std::mem::take(&mut level.queue);
        for id in old {
            if cancelled.remove(&id) {
                active_orders.remove(&id);
            } else {
                level.queue.push_back(id);
            }
        }
        level.cancelled_count = 0;
    }

    /// Physically remove a resting order from its level (modify path).
    fn remove_resting(inner: &mut BookInner, order: &Order, now: Nanos) {
        let BookInner {
            bids,
            asks,
            active_orders,
            ..
        } = inner;
        let ladder = match BookSide::from(order.side) {
            BookSide::Bid => bids,
            BookSide::Ask => asks,
        };
        let mut purge = false;
        if let Some(level) = ladder.level_mut(order.price) {
            level.queue.retain(|&id| id != order.order_id);
            level.reduce(order.remaining_quantity, now);
            purge = level.is_empty() && level.queue.is_empty();
        }
        if purge {
            ladder.remove(order.price);
        }
        active_orders.remove(&order.order_id);
    }

    fn apply_inferred_fill(inner: &mut BookInner, fill: &queue_model::InferredFill, now: Nanos) {
        let BookInner {
            bids,
            asks,
            active_orders,
            ..
        } = inner;
        let ladder = match BookSide::from(fill.side) {
            BookSide::Bid => bids,
            BookSide::Ask => asks,
        };
        let mut purge = false;
        if let Some(level) = ladder.level_mut(fill.price) {
            level.reduce(fill.quantity, now);
            if fill.is_final {
                level.queue.retain(|&id| id != fill.order_id);
            }
            purge = level.is_empty() && level.queue.is_empty();
        }
        if purge {
            ladder.remove(fill.price);
        }
        if fill.is_final {
            active_orders.remove(&fill.order_id);
        } else if let Some(resting) = active_orders.get_mut(&fill.order_id) {
            resting.remaining_quantity = (resting.remaining_quantity - fill.quantity).max(0.0);
            resting.status = OrderStatus::PartiallyFilled;
            resting.last_update_time = now;
        }
    }

    /// Mirror the best levels into the lock-free cells and sample the spread.
    fn refresh_best(&self, inner: &BookInner) {
        let (bid, bid_qty) = inner
            .bids
            .iter()
            .find(|l| !l.is_empty())
            .map(|l| (l.price, l.total_qty))
            .unwrap_or((0.0, 0.0));
        let (ask, ask_qty) = inner
            .asks
            .iter()
            .find(|l| !l.is_empty())
            .map(|l| (l.price, l.total_qty))
            .unwrap_or((0.0, 0.0));

        self.best_bid.store(bid);
        self.best_bid_qty.store(bid_qty);
        self.best_ask.store(ask);
        self.best_ask_qty.store(ask_qty);

        if bid > 0.0 && ask > bid {
            let bps = spread_bps(bid, ask);
            let mut stats = self.stats.lock();
            stats.spread_samples += 1;
            let n = stats.spread_samples as f64;
            stats.stats.avg_spread_bps += (bps - stats.stats.avg_spread_bps) / n;
        }
    }

    fn bump_order_stats(&self) {
        self.stats.lock().stats.total_orders_processed += 1;
    }

    /// Rebuild one side from a snapshot, preserving tracked resting orders
    /// and purging lazily-cancelled ids. Returns the dropped-level count.
    fn apply_snapshot_side(
        inner: &mut BookInner,
        side: BookSide,
        levels: &[Level],
        now: Nanos,
    ) -> u64 {
        let BookInner {
            bids,
            asks,
            active_orders,
            cancelled,
        } = inner;
        let ladder = match side {
            BookSide::Bid => bids,
            BookSide::Ask => asks,
        };

        let mut preserved: Vec<(OrderId, Price, Qty)> = Vec::new();
        let mut purged: Vec<OrderId> = Vec::new();
        for level in ladder.iter() {
            for &id in &level.queue {
                if cancelled.contains(&id) {
                    purged.push(id);
                } else if let Some(order) = active_orders.get(&id) {
                    if order.remaining_quantity > QTY_EPSILON {
                        preserved.push((id, order.price, order.remaining_quantity));
                    }
                }
            }
        }
        for id in purged {
            cancelled.remove(&id);
            active_orders.remove(&id);
        }

        ladder.clear();

        let mut dropped = 0u64;
        for entry in levels {
            if !is_valid_price(entry.price) || !entry.quantity.is_finite() || entry.quantity < 0.0
            {
                dropped += 1;
                continue;
            }
            if entry.quantity <= QTY_EPSILON {
                continue;
            }
            let level = ladder.get_or_insert(entry.price, now);
            level.external_qty = entry.quantity;
            level.total_qty = entry.quantity;
        }

        for (id, price, qty) in preserved {
            let level = ladder.get_or_insert(price, now);
            level.add_tracked(id, qty, now);
        }

        dropped
    }

    /// Apply per-level quantity updates to one side: the published quantity
    /// replaces the level's external component, zero removes the level.
    fn apply_update_side(
        inner: &mut BookInner,
        side: BookSide,
        levels: &[Level],
        now: Nanos,
    ) -> u64 {
        let ladder = match side {
            BookSide::Bid => &mut inner.bids,
            BookSide::Ask => &mut inner.asks,
        };

        let mut dropped = 0u64;
        for entry in levels {
            if !is_valid_price(entry.price) || !entry.quantity.is_finite() || entry.quantity < 0.0
            {
                dropped += 1;
                continue;
            }

            let mut purge = false;
            let mut known = false;
            if let Some(level) = ladder.level_mut(entry.price) {
                known = true;
                let tracked = (level.total_qty - level.external_qty).max(0.0);
                level.external_qty = entry.quantity;
                level.total_qty = tracked + entry.quantity;
                level.last_update = now;
                purge = level.is_empty() && level.queue.is_empty();
            }
            if purge {
                ladder.remove(entry.price);
            }
            if !known && entry.quantity > QTY_EPSILON {
                let level = ladder.get_or_insert(entry.price, now);
                level.external_qty = entry.quantity;
                level.total_qty = entry.quantity;
            }
        }

        dropped
    }

    fn record_trades(&self, executions: &[TradeExecution]) {
        if executions.is_empty() {
            return;
        }
        let mut stats = self.stats.lock();
        stats.stats.total_trades += executions.len() as u64;
        for exec in executions {
            stats.stats.total_volume += exec.quantity;
            stats.stats.last_trade_time = exec.timestamp;
        }
        if let Some(last) = executions.last() {
            self.last_trade_price.store(last.price);
        }
    }

    /// Deliver trade callbacks, fill-sink events, and the book-update
    /// callback. Always called after the book lock is released.
    fn dispatch(&self, executions: &[TradeExecution], sink_events: Vec<SinkEvent>) {
        if !executions.is_empty() {
            let cb = self.callbacks.read().trade.clone();
            if let Some(cb) = cb {
                for exec in executions {
                    cb(exec);
                }
            }
        }

        if !sink_events.is_empty() {
            let sink = self.fill_sink.read().clone();
            if let Some(sink) = sink {
                for event in &sink_events {
                    sink.on_fill(
                        event.order_id,
                        event.qty,
                        event.price,
                        event.timestamp,
                        event.is_final,
                    );
                }
            }
        }

        self.notify_book_update();
    }

    fn notify_book_update(&self) {
        let cb = self.callbacks.read().book_update.clone();
        if let Some(cb) = cb {
            let top = self.top_of_book();
            cb(&top);
        }
    }
}

impl QuoteVenue for OrderBookEngine {
    fn submit(&self, order: &Order) -> (MatchResult, Vec<TradeExecution>) {
        self.submit_order_from_manager(order)
    }

    fn modify(&self, order_id: OrderId, new_price: Price, new_qty: Qty) -> bool {
        self.modify_order(order_id, new_price, new_qty)
    }

    fn cancel(&self, order_id: OrderId) -> bool {
        self.cancel_order(order_id)
    }

    /// Silent cancellation for the emergency-shutdown path: mutates book
    /// state directly, fires no callbacks, and never calls back into the
    /// order manager.
    fn cancel_hint(&self, order_id: OrderId) {
        let now = self.now();
        let mut inner = self.inner.lock();
        if self.cancel_locked(&mut inner, order_id, now) {
            self.refresh_best(&inner);
        }
        drop(inner);
        self.queue.lock().remove(order_id);
        self.our_orders.write().remove(&order_id);
    }

    fn top_of_book(&self) -> TopOfBook {
        OrderBookEngine::top_of_book(self)
    }
}
