//! Order manager tests: lifecycle transitions, risk gating, position and
//! P&L accounting, and the emergency-shutdown path, wired against a real
//! book engine.

use super::*;
use crate::book::OrderBookEngine;
use crate::latency::LatencyTracker;
use crate::pool::MemoryManager;
use crate::types::{
    Level, MarketDepth, Order, OrderStatus, Price, Qty, RiskCheckResult, RiskLimits, Side,
    TradeExecution, TAKER_FEE_RATE,
};
use parking_lot::Mutex as PlMutex;
use std::sync::Arc;

fn wide_limits() -> RiskLimits {
    RiskLimits {
        max_position: 1_000.0,
        max_daily_loss: 1e12,
        max_drawdown: 1.0,
        position_concentration: 1e12,
        var_limit: 1e12,
        max_orders_per_second: 10_000,
        max_latency_ms: 1e9,
        capital_base: 1e12,
    }
}

fn rig(limits: RiskLimits) -> (Arc<OrderBookEngine>, Arc<OrderManager>) {
    let latency = Arc::new(LatencyTracker::new());
    let memory = Arc::new(MemoryManager::new(64));
    let book = Arc::new(OrderBookEngine::new("TEST", latency.clone()));
    let oms = Arc::new(OrderManager::new(memory, latency, limits));
    book.set_fill_sink(oms.clone());
    oms.set_quote_venue(book.clone());
    (book, oms)
}

fn external_print(price: Price, qty: Qty, aggressor: Side) -> TradeExecution {
    TradeExecution {
        trade_id: 0,
        aggressor_order_id: 0,
        passive_order_id: 0,
        price,
        quantity: qty,
        aggressor_side: aggressor,
        timestamp: 0,
    }
}

#[test]
fn order_ids_are_monotonic() {
    let (_book, oms) = rig(wide_limits());
    let a = oms.create_order(Side::Buy, 100.0, 1.0, 100.0);
    let b = oms.create_order(Side::Sell, 101.0, 1.0, 100.5);
    assert!(a > 0);
    assert!(b > a);
}

#[test]
fn invalid_params_rejected_at_create() {
    let (_book, oms) = rig(wide_limits());
    assert_eq!(oms.create_order(Side::Buy, f64::NAN, 1.0, 0.0), 0);
    assert_eq!(oms.create_order(Side::Buy, 100.0, 0.0, 0.0), 0);
    assert_eq!(oms.get_execution_stats().rejected_orders, 2);
}

#[test]
fn created_order_is_pending_only() {
    let (_book, oms) = rig(wide_limits());
    let id = oms.create_order(Side::Buy, 100.0, 1.0, 100.0);

    let info = oms.get_order_info(id).unwrap();
    assert_eq!(info.order.status, OrderStatus::Pending);
    assert_eq!(oms.pending_order_count(), 1);
    assert_eq!(oms.active_order_count(), 0);
}

#[test]
fn submit_transitions_to_acknowledged_and_rests() {
    let (book, oms) = rig(wide_limits());
    let id = oms.create_order(Side::Buy, 100.0, 2.0, 100.0);
    assert!(oms.submit_order(id));

    let info = oms.get_order_info(id).unwrap();
    assert_eq!(info.order.status, OrderStatus::Acknowledged);
    assert!(info.submission_time.is_some());
    assert!(info.acknowledgment_time.is_some());
    assert_eq!(oms.pending_order_count(), 0);
    assert_eq!(oms.active_order_count(), 1);

    let top = book.top_of_book();
    assert_eq!(top.bid_price, 100.0);
    assert_eq!(top.bid_quantity, 2.0);
}

#[test]
fn double_submit_returns_false() {
    let (_book, oms) = rig(wide_limits());
    let id = oms.create_order(Side::Buy, 100.0, 1.0, 100.0);
    assert!(oms.submit_order(id));
    assert!(!oms.submit_order(id));
}

#[test]
fn aggressive_submit_fills_and_updates_position() {
    let (book, oms) = rig(wide_limits());
    book.add_order(&Order::new(900, Side::Sell, 100.0, 10.0, 0));

    let id = oms.create_order(Side::Buy, 100.0, 10.0, 100.0);
    assert!(oms.submit_order(id));

    let info = oms.get_order_info(id).unwrap();
    assert_eq!(info.order.status, OrderStatus::Filled);
    assert!(info.is_aggressive);
    assert_eq!(info.filled_quantity, 10.0);
    assert_eq!(info.average_fill_price, 100.0);

    let position = oms.get_position();
    assert_eq!(position.net_position, 10.0);
    assert!((position.avg_price - 100.0).abs() < 1e-9);
    // Taker fee on 10 @ 100.
    let expected_fee = TAKER_FEE_RATE * 10.0 * 100.0;
    assert!((position.realized_pnl + expected_fee).abs() < 1e-9);

    let stats = oms.get_execution_stats();
    assert_eq!(stats.filled_orders, 1);
    assert!(stats.fill_rate > 0.99);
    assert_eq!(oms.active_order_count(), 0);
}

#[test]
fn passive_fill_through_queue_inference() {
    let (book, oms) = rig(wide_limits());
    book.apply_market_data_update(&MarketDepth::snapshot(
        vec![],
        vec![Level::new(100.0, 50.0)],
        1,
    ));

    let id = oms.create_order(Side::Sell, 100.0, 5.0, 99.95);
    assert!(oms.submit_order(id));
    assert_eq!(
        oms.get_order_info(id).unwrap().order.status,
        OrderStatus::Acknowledged
    );

    book.process_market_data_trade(&external_print(100.0, 30.0, Side::Buy));
    assert_eq!(
        oms.get_order_info(id).unwrap().order.status,
        OrderStatus::Acknowledged
    );

    book.process_market_data_trade(&external_print(100.0, 25.0, Side::Buy));

    let info = oms.get_order_info(id).unwrap();
    assert_eq!(info.order.status, OrderStatus::Filled);
    assert!(!info.is_aggressive);

    let position = oms.get_position();
    assert_eq!(position.net_position, -5.0);
    assert!((position.avg_price - 100.0).abs() < 1e-9);
    // Maker fee is zero; realized stays flat until the short is covered.
    assert_eq!(position.realized_pnl, 0.0);
    assert!((oms.calculate_unrealized_pnl(99.0) - 5.0).abs() < 1e-9);
}

#[test]
fn cancel_pending_order_locally() {
    let (_book, oms) = rig(wide_limits());
    let id = oms.create_order(Side::Buy, 100.0, 1.0, 100.0);
    assert!(oms.cancel_order(id));

    let info = oms.get_order_info(id).unwrap();
    assert_eq!(info.order.status, OrderStatus::Cancelled);
    assert_eq!(oms.pending_order_count(), 0);
    assert_eq!(oms.get_execution_stats().cancelled_orders, 1);
}

#[test]
fn cancel_live_order_through_venue() {
    let (book, oms) = rig(wide_limits());
    let id = oms.create_order(Side::Buy, 100.0, 1.0, 100.0);
    assert!(oms.submit_order(id));
    assert!(oms.cancel_order(id));

    let info = oms.get_order_info(id).unwrap();
    assert_eq!(info.order.status, OrderStatus::Cancelled);
    assert_eq!(book.top_of_book().bid_price, 0.0);
    assert_eq!(oms.active_order_count(), 0);
}

#[test]
fn cancel_unknown_or_terminal_returns_false() {
    let (_book, oms) = rig(wide_limits());
    assert!(!oms.cancel_order(77));

    let id = oms.create_order(Side::Buy, 100.0, 1.0, 100.0);
    assert!(oms.cancel_order(id));
    assert!(!oms.cancel_order(id));
}

#[test]
fn modify_reprices_through_venue() {
    let (book, oms) = rig(wide_limits());
    let id = oms.create_order(Side::Buy, 100.0, 2.0, 100.0);
    assert!(oms.submit_order(id));

    assert!(oms.modify_order(id, 99.0, 0.0, ModificationType::PriceOnly));
    let info = oms.get_order_info(id).unwrap();
    assert_eq!(info.order.price, 99.0);
    assert_eq!(info.order.remaining_quantity, 2.0);
    assert_eq!(info.modification_count, 1);
    assert_eq!(book.top_of_book().bid_price, 99.0);
}

#[test]
fn fill_on_terminal_order_is_ignored() {
    let (_book, oms) = rig(wide_limits());
    let id = oms.create_order(Side::Buy, 100.0, 1.0, 100.0);
    assert!(oms.cancel_order(id));

    assert!(!oms.handle_fill(id, 1.0, 100.0, 1, true));
    assert!(!oms.handle_fill(4242, 1.0, 100.0, 1, true));
    assert_eq!(oms.get_execution_stats().ignored_events, 2);
    assert_eq!(oms.get_position().net_position, 0.0);
}

#[test]
fn rejection_is_terminal() {
    let (_book, oms) = rig(wide_limits());
    let id = oms.create_order(Side::Buy, 100.0, 1.0, 100.0);
    assert!(oms.handle_rejection(id, "post-only would cross"));

    let info = oms.get_order_info(id).unwrap();
    assert_eq!(info.order.status, OrderStatus::Rejected);
    assert!(!oms.submit_order(id));
    assert_eq!(oms.get_execution_stats().rejected_orders, 1);
}

#[test]
fn position_limit_rejects_create() {
    let mut limits = wide_limits();
    limits.max_position = 0.5;
    let (_book, oms) = rig(limits);

    assert_eq!(
        oms.check_pre_trade_risk(Side::Buy, 1.0, 100.0),
        RiskCheckResult::PositionLimitExceeded
    );
    assert_eq!(oms.create_order(Side::Buy, 100.0, 1.0, 100.0), 0);
    // At the limit is allowed.
    assert_eq!(
        oms.check_pre_trade_risk(Side::Buy, 0.5, 100.0),
        RiskCheckResult::Approved
    );
}

#[test]
fn order_rate_limit_boundary() {
    let mut limits = wide_limits();
    limits.max_orders_per_second = 3;
    let (_book, oms) = rig(limits);

    let alerts: Arc<PlMutex<Vec<RiskCheckResult>>> = Arc::new(PlMutex::new(Vec::new()));
    let alerts_cb = alerts.clone();
    oms.set_risk_callback(Arc::new(move |result, _msg| {
        alerts_cb.lock().push(result);
    }));

    let mut ids = Vec::new();
    for i in 0..4 {
        let id = oms.create_order(Side::Buy, 100.0 - i as f64, 0.1, 100.0);
        ids.push(id);
    }

    assert!(ids[0] > 0 && ids[1] > 0 && ids[2] > 0);
    assert_eq!(ids[3], 0);
    for &id in &ids[..3] {
        assert!(oms.submit_order(id));
    }

    let alerts = alerts.lock();
    assert!(alerts.contains(&RiskCheckResult::OrderRateLimitExceeded));
}

#[test]
fn concentration_limit_rejects() {
    let mut limits = wide_limits();
    limits.position_concentration = 0.3;
    limits.capital_base = 10_000.0;
    let (_book, oms) = rig(limits);

    // 1.0 @ 5000 is half the capital base.
    assert_eq!(
        oms.check_pre_trade_risk(Side::Buy, 1.0, 5_000.0),
        RiskCheckResult::ConcentrationRisk
    );
    assert_eq!(
        oms.check_pre_trade_risk(Side::Buy, 0.2, 5_000.0),
        RiskCheckResult::Approved
    );
}

#[test]
fn emergency_shutdown_cancels_everything() {
    let (book, oms) = rig(wide_limits());

    let mut ids = Vec::new();
    for i in 0..3 {
        let id = oms.create_order(Side::Buy, 99.0 - i as f64, 0.1, 100.0);
        assert!(oms.submit_order(id));
        ids.push(id);
    }
    for i in 0..2 {
        let id = oms.create_order(Side::Sell, 101.0 + i as f64, 0.1, 100.0);
        assert!(oms.submit_order(id));
        ids.push(id);
    }
    assert_eq!(oms.active_order_count(), 5);

    oms.emergency_shutdown("daily loss breach");

    for id in ids {
        assert_eq!(
            oms.get_order_info(id).unwrap().order.status,
            OrderStatus::Cancelled
        );
    }
    assert_eq!(oms.active_order_count(), 0);
    assert!(oms.is_emergency_shutdown());
    assert!(!oms.is_healthy());

    // The book was swept through the hint path.
    let top = book.top_of_book();
    assert_eq!(top.bid_price, 0.0);
    assert_eq!(top.ask_price, 0.0);

    // New intents are refused outright.
    assert_eq!(oms.create_order(Side::Buy, 100.0, 0.1, 100.0), 0);
    assert_eq!(
        oms.check_pre_trade_risk(Side::Buy, 0.1, 100.0),
        RiskCheckResult::CriticalBreach
    );
}

#[test]
fn ttl_expires_stale_orders() {
    let (book, oms) = rig(wide_limits());
    oms.set_order_ttl_secs(0);

    let resting = oms.create_order(Side::Buy, 99.0, 0.1, 100.0);
    assert!(oms.submit_order(resting));
    let pending = oms.create_order(Side::Buy, 98.0, 0.1, 100.0);

    // TTL of zero makes everything instantly stale.
    let expired = oms.expire_stale_orders();
    assert_eq!(expired, 2);

    assert_eq!(
        oms.get_order_info(resting).unwrap().order.status,
        OrderStatus::Expired
    );
    assert_eq!(
        oms.get_order_info(pending).unwrap().order.status,
        OrderStatus::Expired
    );
    assert_eq!(oms.get_execution_stats().expired_orders, 2);
    assert_eq!(book.top_of_book().bid_price, 0.0);
}

#[test]
fn round_trip_realizes_spread() {
    let (book, oms) = rig(wide_limits());

    // Buy 1 @ 100 against external liquidity.
    book.apply_market_data_update(&MarketDepth::snapshot(
        vec![],
        vec![Level::new(100.0, 10.0)],
        1,
    ));
    let buy = oms.create_order(Side::Buy, 100.0, 1.0, 100.0);
    assert!(oms.submit_order(buy));

    // Sell 1 @ 101 against external bids.
    book.apply_market_data_update(&MarketDepth::snapshot(
        vec![Level::new(101.0, 10.0)],
        vec![],
        2,
    ));
    let sell = oms.create_order(Side::Sell, 101.0, 1.0, 100.5);
    assert!(oms.submit_order(sell));

    let position = oms.get_position();
    assert_eq!(position.net_position, 0.0);
    let fees = TAKER_FEE_RATE * (1.0 * 100.0 + 1.0 * 101.0);
    assert!((position.realized_pnl - (1.0 - fees)).abs() < 1e-9);
    assert_eq!(position.trade_count, 2);
}

#[test]
fn risk_limits_hot_reload() {
    let (_book, oms) = rig(wide_limits());
    assert_eq!(
        oms.check_pre_trade_risk(Side::Buy, 500.0, 1.0),
        RiskCheckResult::Approved
    );

    let mut tighter = wide_limits();
    tighter.max_position = 1.0;
    oms.update_risk_limits(tighter);

    assert_eq!(
        oms.check_pre_trade_risk(Side::Buy, 500.0, 1.0),
        RiskCheckResult::PositionLimitExceeded
    );
    assert_eq!(oms.risk_limits().max_position, 1.0);
}

#[test]
fn daily_reset_clears_counters() {
    let (book, oms) = rig(wide_limits());
    book.add_order(&Order::new(900, Side::Sell, 100.0, 1.0, 0));
    let id = oms.create_order(Side::Buy, 100.0, 1.0, 100.0);
    assert!(oms.submit_order(id));

    assert!(oms.get_position().daily_volume > 0.0);
    oms.reset_daily_stats();
    let position = oms.get_position();
    assert_eq!(position.daily_volume, 0.0);
    assert_eq!(position.realized_pnl, 0.0);
    // Open position survives.
    assert_eq!(position.net_position, 1.0);
    assert_eq!(oms.get_execution_stats().total_orders, 0);
}
