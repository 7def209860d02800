//! Order Manager
//!
//! Owns every order we issue from intent to terminal state: lifecycle
//! transitions, pre-trade risk gating, position and P&L bookkeeping, and
//! execution statistics. Orders are recycled through the order pool.
//!
//! The manager and the book engine reference each other through the
//! `FillSink` / `QuoteVenue` seams; both are constructed standalone and
//! cross-registered during assembly.

mod position;

#[cfg(test)]
mod oms_tests;

use crate::clock::{Nanos, NANOS_PER_MILLI, NANOS_PER_SEC};
use crate::latency::{LatencyKind, LatencyTracker, ScopedTimer};
use crate::pool::MemoryManager;
use crate::types::{
    is_valid_price, is_valid_quantity, FillSink, Order, OrderId, OrderStatus, MatchResult,
    PositionInfo, Price, Qty, RiskCheckResult, RiskLimits, SharedQuoteVenue, Side,
    DEFAULT_ORDER_TTL_SEC, MAKER_FEE_RATE, TAKER_FEE_RATE,
};
use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use position::PositionBook;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

const QTY_EPSILON: f64 = 1e-9;

/// Which order parameters a modification touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModificationType {
    PriceOnly,
    QuantityOnly,
    PriceAndQuantity,
}

/// Extended per-order record.
#[derive(Debug, Clone, Serialize)]
pub struct OrderInfo {
    pub order: Order,
    pub filled_quantity: Qty,
    pub average_fill_price: Price,
    pub fees_paid: f64,

    pub creation_time: Nanos,
    pub submission_time: Option<Nanos>,
    pub acknowledgment_time: Option<Nanos>,
    pub cancel_requested_at: Option<Nanos>,
    pub completion_time: Option<Nanos>,

    /// Fill price drift from the limit, basis points.
    pub slippage_bps: f64,
    /// Took liquidity on entry.
    pub is_aggressive: bool,
    pub modification_count: u32,
    pub mid_price_at_creation: Price,
    pub mid_price_at_fill: Price,
}

impl OrderInfo {
    fn new(order: Order, mid: Price, now: Nanos) -> Self {
        Self {
            order,
            filled_quantity: 0.0,
            average_fill_price: 0.0,
            fees_paid: 0.0,
            creation_time: now,
            submission_time: None,
            acknowledgment_time: None,
            cancel_requested_at: None,
            completion_time: None,
            slippage_bps: 0.0,
            is_aggressive: false,
            modification_count: 0,
            mid_price_at_creation: mid,
            mid_price_at_fill: 0.0,
        }
    }
}

/// Aggregate execution statistics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ExecutionStats {
    pub total_orders: u64,
    pub filled_orders: u64,
    pub cancelled_orders: u64,
    pub rejected_orders: u64,
    pub expired_orders: u64,
    /// Venue events referencing unknown or terminal orders.
    pub ignored_events: u64,
    pub risk_violations: u32,

    pub avg_submission_latency_us: f64,
    pub avg_fill_time_ms: f64,
    pub avg_cancel_time_ms: f64,
    pub fill_rate: f64,
    pub avg_slippage_bps: f64,
    pub avg_market_impact_bps: f64,

    /// Worst realized loss seen today (positive number).
    pub max_daily_loss: f64,
    /// Drawdown from peak realized P&L, fraction.
    pub current_drawdown: f64,
}

pub type OrderCallback = Arc<dyn Fn(&OrderInfo) + Send + Sync>;
pub type FillCallback = Arc<dyn Fn(&OrderInfo, Qty, Price, bool) + Send + Sync>;
pub type RiskCallback = Arc<dyn Fn(RiskCheckResult, &str) + Send + Sync>;

#[derive(Default)]
struct OmsCallbacks {
    order: Option<OrderCallback>,
    fill: Option<FillCallback>,
    risk: Option<RiskCallback>,
}

struct OrdersInner {
    orders: HashMap<OrderId, OrderInfo>,
    /// Created but not yet submitted.
    pending: HashSet<OrderId>,
    /// Submitted to the venue and not yet terminal.
    active: HashSet<OrderId>,
    /// Pool-backed order buffers, released when their order goes terminal.
    pooled: HashMap<OrderId, Box<Order>>,
}

struct StatsInner {
    stats: ExecutionStats,
    submission_samples: u64,
    fill_time_samples: u64,
    cancel_samples: u64,
    slippage_samples: u64,
    impact_samples: u64,
}

pub struct OrderManager {
    memory: Arc<MemoryManager>,
    latency: Arc<LatencyTracker>,
    risk_limits: ArcSwap<RiskLimits>,
    venue: RwLock<Option<SharedQuoteVenue>>,

    next_order_id: AtomicU64,
    emergency: AtomicBool,
    session_start: Nanos,
    /// Orders older than this are expired by the TTL sweep.
    order_ttl_secs: AtomicU64,

    orders: Mutex<OrdersInner>,
    position: Mutex<PositionBook>,
    stats: Mutex<StatsInner>,
    /// Creation timestamps inside the sliding one-second window.
    rate_window: Mutex<VecDeque<Nanos>>,

    callbacks: RwLock<OmsCallbacks>,
}

impl OrderManager {
    pub fn new(
        memory: Arc<MemoryManager>,
        latency: Arc<LatencyTracker>,
        risk_limits: RiskLimits,
    ) -> Self {
        let session_start = latency.clock().now();
        Self {
            memory,
            latency,
            risk_limits: ArcSwap::from_pointee(risk_limits),
            venue: RwLock::new(None),
            next_order_id: AtomicU64::new(1),
            emergency: AtomicBool::new(false),
            session_start,
            order_ttl_secs: AtomicU64::new(DEFAULT_ORDER_TTL_SEC),
            orders: Mutex::new(OrdersInner {
                orders: HashMap::new(),
                pending: HashSet::new(),
                active: HashSet::new(),
                pooled: HashMap::new(),
            }),
            position: Mutex::new(PositionBook::new()),
            stats: Mutex::new(StatsInner {
                stats: ExecutionStats::default(),
                submission_samples: 0,
                fill_time_samples: 0,
                cancel_samples: 0,
                slippage_samples: 0,
                impact_samples: 0,
            }),
            rate_window: Mutex::new(VecDeque::new()),
            callbacks: RwLock::new(OmsCallbacks::default()),
        }
    }

    /// Second wiring phase: register the venue orders are routed to.
    pub fn set_quote_venue(&self, venue: SharedQuoteVenue) {
        *self.venue.write() = Some(venue);
    }

    pub fn set_order_callback(&self, cb: OrderCallback) {
        self.callbacks.write().order = Some(cb);
    }

    pub fn set_fill_callback(&self, cb: FillCallback) {
        self.callbacks.write().fill = Some(cb);
    }

    pub fn set_risk_callback(&self, cb: RiskCallback) {
        self.callbacks.write().risk = Some(cb);
    }

    pub fn clear_callbacks(&self) {
        *self.callbacks.write() = OmsCallbacks::default();
    }

    #[inline]
    fn now(&self) -> Nanos {
        self.latency.clock().now()
    }

    // =========================================================================
    // ORDER OPERATIONS (CRITICAL PATH)
    // =========================================================================

    /// Create a new order in PENDING state. Returns the assigned id, or 0
    /// when the pre-trade risk gate rejects the intent.
    pub fn create_order(&self, side: Side, price: Price, quantity: Qty, mid: Price) -> OrderId {
        let _timer = ScopedTimer::fast(&self.latency, LatencyKind::OrderPlacement);

        if self.emergency.load(Ordering::Acquire) {
            self.notify_risk(RiskCheckResult::CriticalBreach, "emergency shutdown active");
            return 0;
        }
        if !is_valid_price(price) || !is_valid_quantity(quantity) {
            self.stats.lock().stats.rejected_orders += 1;
            warn!(price, quantity, "create rejected: invalid params");
            return 0;
        }

        let risk = self.run_risk_checks(side, quantity, price, true);
        if !risk.approved() {
            let mut stats = self.stats.lock();
            stats.stats.rejected_orders += 1;
            stats.stats.risk_violations += 1;
            drop(stats);
            warn!(result = risk.as_str(), "create rejected by risk gate");
            self.notify_risk(risk, "pre-trade risk rejection");
            return 0;
        }

        let now = self.now();
        {
            let mut window = self.rate_window.lock();
            let cutoff = now - NANOS_PER_SEC;
            while window.front().is_some_and(|&t| t < cutoff) {
                window.pop_front();
            }
            window.push_back(now);
        }

        let order_id = self.next_order_id.fetch_add(1, Ordering::Relaxed);
        let mut pooled = self.memory.order_pool().acquire_order();
        pooled.order_id = order_id;
        pooled.side = side;
        pooled.price = price;
        pooled.original_quantity = quantity;
        pooled.remaining_quantity = quantity;
        pooled.status = OrderStatus::Pending;
        pooled.entry_time = now;
        pooled.last_update_time = now;
        pooled.mid_price_at_entry = mid;

        let info = OrderInfo::new((*pooled).clone(), mid, now);
        {
            let mut orders = self.orders.lock();
            orders.orders.insert(order_id, info.clone());
            orders.pending.insert(order_id);
            orders.pooled.insert(order_id, pooled);
        }
        self.stats.lock().stats.total_orders += 1;

        self.notify_order(&info);
        debug!(order_id, side = side.as_str(), price, quantity, "order created");
        order_id
    }

    /// Run pre-trade risk and forward a PENDING order to the venue.
    pub fn submit_order(&self, order_id: OrderId) -> bool {
        let _timer = ScopedTimer::fast(&self.latency, LatencyKind::OrderPlacement);

        if self.emergency.load(Ordering::Acquire) {
            return false;
        }

        let snapshot = {
            let orders = self.orders.lock();
            match orders.orders.get(&order_id) {
                Some(info) if info.order.status == OrderStatus::Pending => info.order.clone(),
                Some(_) => {
                    self.stats.lock().stats.ignored_events += 1;
                    return false;
                }
                None => return false,
            }
        };

        let risk = self.run_risk_checks(
            snapshot.side,
            snapshot.remaining_quantity,
            snapshot.price,
            false,
        );
        if !risk.approved() {
            self.reject_locked(order_id, risk.as_str());
            self.notify_risk(risk, "submission risk rejection");
            return false;
        }

        let Some(venue) = self.venue.read().clone() else {
            self.reject_locked(order_id, "no venue configured");
            return false;
        };

        let submit_start = self.now();
        {
            let mut orders = self.orders.lock();
            let Some(info) = orders.orders.get_mut(&order_id) else {
                return false;
            };
            info.order.status = OrderStatus::Submitted;
            info.submission_time = Some(submit_start);
            orders.pending.remove(&order_id);
            orders.active.insert(order_id);
        }

        // Fills from an immediate match re-enter through `FillSink` while
        // this call is in flight; no manager lock is held across it.
        let (result, _executions) = venue.submit(&snapshot);

        if result == MatchResult::Rejected {
            self.handle_rejection(order_id, "venue rejected order");
            return false;
        }

        let acked_at = self.now();
        self.handle_order_ack(order_id, acked_at);

        let mut stats = self.stats.lock();
        stats.submission_samples += 1;
        let n = stats.submission_samples as f64;
        let sample_us = (acked_at - submit_start) as f64 / 1_000.0;
        stats.stats.avg_submission_latency_us +=
            (sample_us - stats.stats.avg_submission_latency_us) / n;
        drop(stats);

        debug!(order_id, ?result, "order submitted");
        true
    }

    /// Modify a live order through the venue.
    pub fn modify_order(
        &self,
        order_id: OrderId,
        new_price: Price,
        new_quantity: Qty,
        mod_type: ModificationType,
    ) -> bool {
        let (target_price, target_qty) = {
            let orders = self.orders.lock();
            let Some(info) = orders.orders.get(&order_id) else {
                return false;
            };
            if !matches!(
                info.order.status,
                OrderStatus::Submitted | OrderStatus::Acknowledged | OrderStatus::PartiallyFilled
            ) {
                return false;
            }
            match mod_type {
                ModificationType::PriceOnly => (new_price, info.order.remaining_quantity),
                ModificationType::QuantityOnly => (info.order.price, new_quantity),
                ModificationType::PriceAndQuantity => (new_price, new_quantity),
            }
        };

        let Some(venue) = self.venue.read().clone() else {
            return false;
        };
        if !venue.modify(order_id, target_price, target_qty) {
            return false;
        }

        let mut orders = self.orders.lock();
        if let Some(info) = orders.orders.get_mut(&order_id) {
            info.order.price = target_price;
            info.order.remaining_quantity = target_qty;
            info.order.last_update_time = self.now();
            info.modification_count += 1;
        }
        true
    }

    /// Cancel an order. PENDING orders are cancelled locally; live ones go
    /// through the venue and complete on the cancel confirmation.
    pub fn cancel_order(&self, order_id: OrderId) -> bool {
        let _timer = ScopedTimer::fast(&self.latency, LatencyKind::OrderCancellation);

        let now = self.now();
        enum Route {
            Local(OrderInfo),
            Venue,
            Refuse,
        }

        let route = {
            let mut orders = self.orders.lock();
            let Some(info) = orders.orders.get_mut(&order_id) else {
                return false;
            };
            match info.order.status {
                OrderStatus::Pending => {
                    info.order.status = OrderStatus::Cancelled;
                    info.completion_time = Some(now);
                    let snapshot = info.clone();
                    orders.pending.remove(&order_id);
                    Self::release_pooled(&self.memory, &mut orders, order_id);
                    Route::Local(snapshot)
                }
                s if s.can_cancel() => {
                    info.order.status = OrderStatus::Cancelling;
                    info.cancel_requested_at = Some(now);
                    Route::Venue
                }
                _ => Route::Refuse,
            }
        };

        match route {
            Route::Local(info) => {
                self.stats.lock().stats.cancelled_orders += 1;
                self.notify_order(&info);
                true
            }
            Route::Venue => {
                let Some(venue) = self.venue.read().clone() else {
                    return false;
                };
                if venue.cancel(order_id) {
                    self.handle_cancel_confirmation(order_id);
                    true
                } else {
                    // Lost the cancel race; restore state unless a fill beat us.
                    let mut orders = self.orders.lock();
                    if let Some(info) = orders.orders.get_mut(&order_id) {
                        if info.order.status == OrderStatus::Cancelling {
                            info.order.status = if info.filled_quantity > QTY_EPSILON {
                                OrderStatus::PartiallyFilled
                            } else {
                                OrderStatus::Acknowledged
                            };
                            info.cancel_requested_at = None;
                        }
                    }
                    false
                }
            }
            Route::Refuse => false,
        }
    }

    // =========================================================================
    // VENUE-DRIVEN TRANSITIONS
    // =========================================================================

    pub fn handle_order_ack(&self, order_id: OrderId, ts: Nanos) -> bool {
        let snapshot = {
            let mut orders = self.orders.lock();
            let Some(info) = orders.orders.get_mut(&order_id) else {
                return false;
            };
            match info.order.status {
                OrderStatus::Submitted => {
                    info.order.status = OrderStatus::Acknowledged;
                    info.acknowledgment_time = Some(ts);
                    Some(info.clone())
                }
                OrderStatus::PartiallyFilled if info.acknowledgment_time.is_none() => {
                    info.acknowledgment_time = Some(ts);
                    None
                }
                _ => return false,
            }
        };
        if let Some(info) = snapshot {
            self.notify_order(&info);
        }
        true
    }

    /// Apply a fill. Updates the order record, position and P&L, and
    /// execution statistics. Fills on unknown or terminal orders are counted
    /// and ignored.
    pub fn handle_fill(
        &self,
        order_id: OrderId,
        fill_qty: Qty,
        fill_price: Price,
        ts: Nanos,
        is_final: bool,
    ) -> bool {
        if fill_qty <= QTY_EPSILON || !is_valid_price(fill_price) {
            self.stats.lock().stats.ignored_events += 1;
            return false;
        }

        let (info_snapshot, side, fee, final_now, creation_time) = {
            let mut orders = self.orders.lock();
            let (snapshot, fee, final_now) = {
                let Some(info) = orders.orders.get_mut(&order_id) else {
                    self.stats.lock().stats.ignored_events += 1;
                    warn!(order_id, "fill for unknown order ignored");
                    return false;
                };
                if info.order.status.is_terminal() {
                    self.stats.lock().stats.ignored_events += 1;
                    warn!(order_id, "fill on terminal order ignored");
                    return false;
                }

                // A fill arriving before the ack means we crossed on entry.
                let aggressive = info.order.status == OrderStatus::Submitted
                    || (info.order.status == OrderStatus::PartiallyFilled
                        && info.acknowledgment_time.is_none());
                let fee_rate = if aggressive { TAKER_FEE_RATE } else { MAKER_FEE_RATE };
                let fee = fee_rate * fill_qty * fill_price;

                let prev_value = info.average_fill_price * info.filled_quantity;
                info.filled_quantity += fill_qty;
                info.average_fill_price =
                    (prev_value + fill_price * fill_qty) / info.filled_quantity;
                info.order.remaining_quantity =
                    (info.order.remaining_quantity - fill_qty).max(0.0);
                info.order.last_update_time = ts;
                info.fees_paid += fee;
                info.is_aggressive |= aggressive;
                info.mid_price_at_fill = fill_price;
                if info.order.price > 0.0 {
                    info.slippage_bps =
                        (info.average_fill_price - info.order.price) / info.order.price * 10_000.0;
                }

                let final_now = is_final || info.order.remaining_quantity <= QTY_EPSILON;
                if final_now {
                    info.order.status = OrderStatus::Filled;
                    info.order.remaining_quantity = 0.0;
                    info.completion_time = Some(ts);
                } else {
                    info.order.status = OrderStatus::PartiallyFilled;
                }
                (info.clone(), fee, final_now)
            };

            if final_now {
                orders.active.remove(&order_id);
                orders.pending.remove(&order_id);
                Self::release_pooled(&self.memory, &mut orders, order_id);
            }

            let side = snapshot.order.side;
            let creation = snapshot.creation_time;
            (snapshot, side, fee, final_now, creation)
        };

        let position_snapshot = {
            let mut position = self.position.lock();
            position.apply_fill(side, fill_qty, fill_price, fee, ts);
            (position.realized_pnl(), position.drawdown())
        };

        {
            let mut stats = self.stats.lock();
            if final_now {
                stats.stats.filled_orders += 1;
                stats.fill_time_samples += 1;
                let n = stats.fill_time_samples as f64;
                let ms = (ts - creation_time) as f64 / NANOS_PER_MILLI as f64;
                stats.stats.avg_fill_time_ms += (ms - stats.stats.avg_fill_time_ms) / n;
            }
            stats.slippage_samples += 1;
            let n = stats.slippage_samples as f64;
            stats.stats.avg_slippage_bps +=
                (info_snapshot.slippage_bps - stats.stats.avg_slippage_bps) / n;

            if info_snapshot.mid_price_at_creation > 0.0 {
                stats.impact_samples += 1;
                let n = stats.impact_samples as f64;
                let impact = ((fill_price - info_snapshot.mid_price_at_creation)
                    / info_snapshot.mid_price_at_creation
                    * 10_000.0)
                    .abs();
                stats.stats.avg_market_impact_bps +=
                    (impact - stats.stats.avg_market_impact_bps) / n;
            }

            let (realized, drawdown) = position_snapshot;
            if -realized > stats.stats.max_daily_loss {
                stats.stats.max_daily_loss = -realized;
            }
            stats.stats.current_drawdown = drawdown;
        }

        let cb = self.callbacks.read().fill.clone();
        if let Some(cb) = cb {
            cb(&info_snapshot, fill_qty, fill_price, final_now);
        }
        self.notify_order(&info_snapshot);
        true
    }

    /// Terminal rejection from the venue or the risk gate.
    pub fn handle_rejection(&self, order_id: OrderId, reason: &str) -> bool {
        if self.reject_locked(order_id, reason) {
            warn!(order_id, reason, "order rejected");
            true
        } else {
            false
        }
    }

    pub fn handle_cancel_confirmation(&self, order_id: OrderId) -> bool {
        let now = self.now();
        let snapshot = {
            let mut orders = self.orders.lock();
            let Some(info) = orders.orders.get_mut(&order_id) else {
                self.stats.lock().stats.ignored_events += 1;
                return false;
            };
            if info.order.status.is_terminal() {
                return false;
            }
            info.order.status = OrderStatus::Cancelled;
            info.completion_time = Some(now);
            let snapshot = info.clone();
            orders.active.remove(&order_id);
            orders.pending.remove(&order_id);
            Self::release_pooled(&self.memory, &mut orders, order_id);
            snapshot
        };

        {
            let mut stats = self.stats.lock();
            stats.stats.cancelled_orders += 1;
            if let Some(requested) = snapshot.cancel_requested_at {
                stats.cancel_samples += 1;
                let n = stats.cancel_samples as f64;
                let ms = (now - requested) as f64 / NANOS_PER_MILLI as f64;
                stats.stats.avg_cancel_time_ms += (ms - stats.stats.avg_cancel_time_ms) / n;
            }
        }

        self.notify_order(&snapshot);
        true
    }

    /// Override the order TTL (default 120 s).
    pub fn set_order_ttl_secs(&self, secs: u64) {
        self.order_ttl_secs.store(secs, Ordering::Relaxed);
    }

    /// Expire non-terminal orders older than the TTL. Returns how many.
    pub fn expire_stale_orders(&self) -> usize {
        let now = self.now();
        let ttl = self.order_ttl_secs.load(Ordering::Relaxed) as i64 * NANOS_PER_SEC;

        let expired: Vec<(OrderId, bool)> = {
            let orders = self.orders.lock();
            orders
                .orders
                .iter()
                .filter(|(_, info)| {
                    !info.order.status.is_terminal() && now - info.creation_time > ttl
                })
                .map(|(&id, info)| (id, orders.active.contains(&id) || info.order.status.is_active()))
                .collect()
        };
        if expired.is_empty() {
            return 0;
        }

        let venue = self.venue.read().clone();
        for (id, live) in &expired {
            if *live {
                if let Some(venue) = venue.as_ref() {
                    venue.cancel_hint(*id);
                }
            }
            let snapshot = {
                let mut orders = self.orders.lock();
                let Some(info) = orders.orders.get_mut(id) else {
                    continue;
                };
                if info.order.status.is_terminal() {
                    continue;
                }
                info.order.status = OrderStatus::Expired;
                info.completion_time = Some(now);
                let snapshot = info.clone();
                orders.pending.remove(id);
                orders.active.remove(id);
                Self::release_pooled(&self.memory, &mut orders, *id);
                snapshot
            };
            self.stats.lock().stats.expired_orders += 1;
            self.notify_order(&snapshot);
            debug!(order_id = id, "order expired by ttl");
        }
        expired.len()
    }

    // =========================================================================
    // RISK
    // =========================================================================

    /// Pure pre-trade check over current state, in deterministic order.
    pub fn check_pre_trade_risk(&self, side: Side, quantity: Qty, price: Price) -> RiskCheckResult {
        self.run_risk_checks(side, quantity, price, true)
    }

    /// Hot-swap the risk limits.
    pub fn update_risk_limits(&self, new_limits: RiskLimits) {
        debug!(?new_limits, "risk limits updated");
        self.risk_limits.store(Arc::new(new_limits));
    }

    pub fn risk_limits(&self) -> RiskLimits {
        (**self.risk_limits.load()).clone()
    }

    /// Cancel every live order and refuse new ones. The venue is told to
    /// drop each order through `cancel_hint`, which never calls back into
    /// this manager, so no lock can be held against us.
    pub fn emergency_shutdown(&self, reason: &str) {
        if self.emergency.swap(true, Ordering::AcqRel) {
            return;
        }
        error!(reason, "emergency shutdown: cancelling all live orders");

        let ids: Vec<OrderId> = {
            let orders = self.orders.lock();
            orders
                .orders
                .iter()
                .filter(|(_, info)| !info.order.status.is_terminal())
                .map(|(&id, _)| id)
                .collect()
        };

        let venue = self.venue.read().clone();
        if let Some(venue) = venue {
            for id in &ids {
                venue.cancel_hint(*id);
            }
        }

        let now = self.now();
        let mut cancelled = 0u64;
        {
            let mut orders = self.orders.lock();
            for id in &ids {
                if let Some(info) = orders.orders.get_mut(id) {
                    if info.order.status.is_terminal() {
                        continue;
                    }
                    info.order.status = OrderStatus::Cancelled;
                    info.completion_time = Some(now);
                    cancelled += 1;
                }
                orders.pending.remove(id);
                orders.active.remove(id);
                Self::release_pooled(&self.memory, &mut orders, *id);
            }
        }
        self.stats.lock().stats.cancelled_orders += cancelled;

        self.notify_risk(RiskCheckResult::CriticalBreach, reason);
    }

    pub fn is_emergency_shutdown(&self) -> bool {
        self.emergency.load(Ordering::Acquire)
    }

    fn run_risk_checks(
        &self,
        side: Side,
        quantity: Qty,
        price: Price,
        include_rate: bool,
    ) -> RiskCheckResult {
        if self.emergency.load(Ordering::Acquire) {
            return RiskCheckResult::CriticalBreach;
        }

        let limits = self.risk_limits.load();
        let (net_position, realized) = {
            let position = self.position.lock();
            (position.net_position(), position.realized_pnl())
        };

        let projected = net_position + side.sign() * quantity;
        if projected.abs() > limits.max_position + QTY_EPSILON {
            return RiskCheckResult::PositionLimitExceeded;
        }

        if realized <= -limits.max_daily_loss {
            return RiskCheckResult::DailyLossLimitExceeded;
        }

        if include_rate {
            let now = self.now();
            let cutoff = now - NANOS_PER_SEC;
            let recent = self
                .rate_window
                .lock()
                .iter()
                .rev()
                .take_while(|&&t| t >= cutoff)
                .count();
            if recent >= limits.max_orders_per_second as usize {
                return RiskCheckResult::OrderRateLimitExceeded;
            }
        }

        if limits.capital_base > 0.0 {
            let concentration = projected.abs() * price / limits.capital_base;
            if concentration > limits.position_concentration {
                return RiskCheckResult::ConcentrationRisk;
            }
        }

        let p95_us = self.latency.p95_estimate(LatencyKind::OrderPlacement);
        if p95_us > limits.max_latency_ms * 1_000.0 {
            return RiskCheckResult::LatencyLimitExceeded;
        }

        RiskCheckResult::Approved
    }

    // =========================================================================
    // READ-ONLY ACCESSORS
    // =========================================================================

    pub fn get_position(&self) -> PositionInfo {
        self.position.lock().info()
    }

    pub fn calculate_unrealized_pnl(&self, mid: Price) -> f64 {
        self.position.lock().unrealized_pnl(mid)
    }

    /// Refresh the mark-to-market figure against a new mid.
    pub fn mark_position(&self, mid: Price) {
        let now = self.now();
        self.position.lock().mark(mid, now);
    }

    /// Adjust the position with a fill that happened outside this manager.
    pub fn update_position(&self, side: Side, quantity: Qty, price: Price) {
        let now = self.now();
        self.position.lock().apply_fill(side, quantity, price, 0.0, now);
    }

    pub fn get_execution_stats(&self) -> ExecutionStats {
        let mut stats = self.stats.lock();
        if stats.stats.total_orders > 0 {
            stats.stats.fill_rate =
                stats.stats.filled_orders as f64 / stats.stats.total_orders as f64;
        }
        stats.stats
    }

    pub fn get_order_info(&self, order_id: OrderId) -> Option<OrderInfo> {
        self.orders.lock().orders.get(&order_id).cloned()
    }

    pub fn get_active_orders(&self) -> Vec<OrderId> {
        self.orders.lock().active.iter().copied().collect()
    }

    pub fn active_order_count(&self) -> usize {
        self.orders.lock().active.len()
    }

    pub fn pending_order_count(&self) -> usize {
        self.orders.lock().pending.len()
    }

    pub fn session_start(&self) -> Nanos {
        self.session_start
    }

    pub fn is_healthy(&self) -> bool {
        !self.emergency.load(Ordering::Acquire) && self.venue.read().is_some()
    }

    /// Zero daily statistics at the start of a trading day.
    pub fn reset_daily_stats(&self) {
        self.position.lock().reset_daily();
        let mut stats = self.stats.lock();
        stats.stats = ExecutionStats::default();
        stats.submission_samples = 0;
        stats.fill_time_samples = 0;
        stats.cancel_samples = 0;
        stats.slippage_samples = 0;
        stats.impact_samples = 0;
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn reject_locked(&self, order_id: OrderId, reason: &str) -> bool {
        let snapshot = {
            let mut orders = self.orders.lock();
            let Some(info) = orders.orders.get_mut(&order_id) else {
                return false;
            };
            if info.order.status.is_terminal() {
                return false;
            }
            info.order.status = OrderStatus::Rejected;
            info.completion_time = Some(self.now());
            let snapshot = info.clone();
            orders.pending.remove(&order_id);
            orders.active.remove(&order_id);
            Self::release_pooled(&self.memory, &mut orders, order_id);
            snapshot
        };
        self.stats.lock().stats.rejected_orders += 1;
        let _ = reason;
        self.notify_order(&snapshot);
        true
    }

    fn release_pooled(memory: &MemoryManager, orders: &mut OrdersInner, order_id: OrderId) {
        if let Some(buffer) = orders.pooled.remove(&order_id) {
            memory.order_pool().release_order(buffer);
        }
    }

    fn notify_order(&self, info: &OrderInfo) {
        let cb = self.callbacks.read().order.clone();
        if let Some(cb) = cb {
            cb(info);
        }
    }

    fn notify_risk(&self, result: RiskCheckResult, message: &str) {
        let cb = self.callbacks.read().risk.clone();
        if let Some(cb) = cb {
            cb(result, message);
        }
    }
}

impl FillSink for OrderManager {
    fn on_fill(&self, order_id: OrderId, qty: Qty, price: Price, ts: Nanos, is_final: bool) {
        self.handle_fill(order_id, qty, price, ts, is_final);
    }

    fn on_ack(&self, order_id: OrderId, ts: Nanos) {
        self.handle_order_ack(order_id, ts);
    }

    fn on_cancel_confirmed(&self, order_id: OrderId) {
        self.handle_cancel_confirmation(order_id);
    }
}
